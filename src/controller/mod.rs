//! Controller - periodic reconciliation against the management API
//!
//! Owns the node's control plane: on startup and on every tick it pulls
//! the node description and user list from the panel, applies the diff
//! to the engine registries, limiter and rule engine, and pushes status,
//! traffic, online-device and rule-hit reports back. Per-step failures
//! abort the step, never the periodic; every add/remove is idempotent so
//! a failed tick is safely retried on the next interval.

mod diff;
mod periodic;

pub use diff::diff_users;
pub use periodic::Periodic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::api::{Api, NodeInfo, NodeType, OnlineUser, UserInfo, UserTraffic};
use crate::app::metrics::CONTROLLER_REPORTS;
use crate::cert::CertManager;
use crate::config::Config;
use crate::engine::stats::{downlink_counter_name, uplink_counter_name};
use crate::engine::{
    EngineUser, InboundManager, InboundSpec, OutboundManager, OutboundSpec, StatsManager,
    UserAccount,
};
use crate::error::Result;
use crate::limiter::Limiter;
use crate::rule::RuleManager;
use crate::system;

#[derive(Default)]
struct ControllerState {
    node_info: Option<NodeInfo>,
    user_list: Vec<UserInfo>,
}

pub struct Controller {
    config: Config,
    api: Arc<dyn Api>,
    inbounds: Arc<dyn InboundManager>,
    outbounds: Arc<dyn OutboundManager>,
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
    stats: Arc<dyn StatsManager>,
    cert: Option<Arc<dyn CertManager>>,
    state: Mutex<ControllerState>,
    tasks: Mutex<Vec<Periodic>>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        api: Arc<dyn Api>,
        inbounds: Arc<dyn InboundManager>,
        outbounds: Arc<dyn OutboundManager>,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
        stats: Arc<dyn StatsManager>,
        cert: Option<Arc<dyn CertManager>>,
    ) -> Self {
        Self {
            config,
            api,
            inbounds,
            outbounds,
            limiter,
            rules,
            stats,
            cert,
            state: Mutex::new(ControllerState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Initial sync, then launch the two reconciliation periodics.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let client = self.api.describe();
        info!(
            host = %client.api_host,
            node_id = client.node_id,
            node_type = %client.node_type,
            "starting controller"
        );

        self.bootstrap().await?;

        let interval = Duration::from_secs(self.config.update_periodic);

        let controller = Arc::clone(self);
        let node_monitor = Periodic::spawn("node_info_monitor", interval, move || {
            let controller = Arc::clone(&controller);
            async move { controller.node_info_monitor().await }
        });
        info!("start monitor node status");

        let controller = Arc::clone(self);
        let user_monitor = Periodic::spawn("user_info_monitor", interval, move || {
            let controller = Arc::clone(&controller);
            async move { controller.user_info_monitor().await }
        });
        info!("start report node status");

        *self.tasks.lock() = vec![node_monitor, user_monitor];
        Ok(())
    }

    /// Stop both periodic tasks. Always closes both unconditionally.
    pub async fn close(&self) {
        let tasks: Vec<Periodic> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            info!(task = task.name(), "stopping periodic");
            task.close().await;
        }
    }

    /// First fetch: register the node, its users, limiter and rules.
    async fn bootstrap(&self) -> Result<()> {
        let node_info = self.api.get_node_info().await?;
        self.add_node(&node_info)?;

        let users = self.api.get_user_list().await?;
        self.add_node_users(&node_info, &users)?;

        let tag = node_info.tag();
        self.limiter.add_inbound(&tag, node_info.speed_limit, &users);
        self.rules.update_users(&tag, &users, &[]);
        match self.api.get_node_rules().await {
            Ok(rules) => self.rules.update_rules(&tag, &rules),
            Err(e) => warn!("failed to fetch detect rules: {}", e),
        }

        let mut state = self.state.lock();
        state.node_info = Some(node_info);
        state.user_list = users;
        Ok(())
    }

    /// Tick 1: converge local node and user state onto the panel's.
    async fn node_info_monitor(&self) -> Result<()> {
        let new_node = self.api.get_node_info().await?;

        let old_node = self.state.lock().node_info.clone();
        let node_changed = old_node.as_ref() != Some(&new_node);
        if node_changed {
            if let Some(old) = &old_node {
                let old_tag = old.tag();
                self.remove_node(&old_tag)?;
                self.limiter.delete_inbound(&old_tag);
                self.rules.delete_inbound(&old_tag);
            }
            self.add_node(&new_node)?;
            self.state.lock().node_info = Some(new_node.clone());
        }

        // Certificate renewal is best-effort and never aborts the tick.
        if new_node.enable_tls && self.config.cert.cert_mode.needs_renewal() {
            if let Some(cert) = &self.cert {
                let cc = &self.config.cert;
                if let Err(e) = cert
                    .renew_cert(&cc.cert_domain, &cc.email, cc.cert_mode, &cc.provider, &cc.dns_env)
                    .await
                {
                    warn!("cert renewal failed: {}", e);
                }
            }
        }

        let tag = new_node.tag();
        match self.api.get_node_rules().await {
            Ok(rules) => self.rules.update_rules(&tag, &rules),
            Err(e) => warn!("failed to fetch detect rules: {}", e),
        }

        let new_users = self.api.get_user_list().await?;
        if node_changed {
            self.add_node_users(&new_node, &new_users)?;
            self.limiter
                .add_inbound(&tag, new_node.speed_limit, &new_users);
            self.rules.update_users(&tag, &new_users, &[]);
        } else {
            let old_users = self.state.lock().user_list.clone();
            let (deleted, added) = diff_users(&old_users, &new_users);
            if !deleted.is_empty() {
                let emails: Vec<String> = deleted.iter().map(|u| u.email.clone()).collect();
                if let Err(e) = self.inbounds.remove_users(&tag, &emails) {
                    warn!("failed to remove users: {}", e);
                }
                self.limiter.update_users(&tag, &[], &emails);
                self.rules.update_users(&tag, &[], &emails);
            }
            if !added.is_empty() {
                if let Err(e) = self.add_node_users(&new_node, &added) {
                    warn!("failed to add users: {}", e);
                }
                self.limiter.update_users(&tag, &added, &[]);
                self.rules.update_users(&tag, &added, &[]);
            }
            if !deleted.is_empty() || !added.is_empty() {
                info!("{} user deleted, {} user added", deleted.len(), added.len());
            }
        }
        self.state.lock().user_list = new_users;
        Ok(())
    }

    /// Tick 2: push status, traffic, online devices and rule hits.
    async fn user_info_monitor(&self) -> Result<()> {
        let status = system::probe();
        match self.api.report_node_status(&status).await {
            Ok(()) => CONTROLLER_REPORTS.with_label_values(&["status"]).inc(),
            Err(e) => warn!("failed to report node status: {}", e),
        }

        let (tag, users) = {
            let state = self.state.lock();
            (
                state.node_info.as_ref().map(|n| n.tag()),
                state.user_list.clone(),
            )
        };

        let mut traffic = Vec::new();
        for user in &users {
            let up = self
                .stats
                .get(&uplink_counter_name(&user.email))
                .map(|c| c.take())
                .unwrap_or(0);
            let down = self
                .stats
                .get(&downlink_counter_name(&user.email))
                .map(|c| c.take())
                .unwrap_or(0);
            if up > 0 || down > 0 {
                traffic.push(UserTraffic {
                    uid: user.uid,
                    email: user.email.clone(),
                    upload: up,
                    download: down,
                });
            }
        }
        if !traffic.is_empty() {
            match self.api.report_user_traffic(&traffic).await {
                Ok(()) => CONTROLLER_REPORTS.with_label_values(&["traffic"]).inc(),
                Err(e) => warn!("failed to report user traffic: {}", e),
            }
        }

        if let Some(tag) = tag {
            let devices = self.limiter.online_devices(&tag);
            if !devices.is_empty() {
                let uid_by_email: HashMap<&str, i64> =
                    users.iter().map(|u| (u.email.as_str(), u.uid)).collect();
                let online: Vec<OnlineUser> = devices
                    .iter()
                    .filter_map(|(email, ip)| {
                        uid_by_email
                            .get(email.as_str())
                            .map(|uid| OnlineUser { uid: *uid, ip: *ip })
                    })
                    .collect();
                if !online.is_empty() {
                    match self.api.report_node_online_users(&online).await {
                        Ok(()) => CONTROLLER_REPORTS.with_label_values(&["online"]).inc(),
                        Err(e) => warn!("failed to report online devices: {}", e),
                    }
                }
            }
        }

        let hits = self.rules.drain_hits();
        if !hits.is_empty() {
            match self.api.report_illegal(&hits).await {
                Ok(()) => CONTROLLER_REPORTS.with_label_values(&["illegal"]).inc(),
                Err(e) => warn!("failed to report rule hits: {}", e),
            }
        }
        Ok(())
    }

    /// Register the inbound and its paired outbound for a node.
    fn add_node(&self, node: &NodeInfo) -> Result<()> {
        let tag = node.tag();
        let protocol = match node.node_type {
            NodeType::V2ray => {
                if node.enable_vless {
                    "vless"
                } else {
                    "vmess"
                }
            }
            NodeType::Trojan => "trojan",
            NodeType::Shadowsocks => "shadowsocks",
        };
        self.inbounds.add_inbound(InboundSpec {
            tag: tag.clone(),
            listen_ip: self.config.listen_ip.clone(),
            port: node.port,
            protocol: protocol.to_string(),
            transport: node.transport_protocol.clone(),
            host: node.host.clone(),
            path: node.path.clone(),
            tls: node.enable_tls,
        })?;
        self.outbounds.add_handler(OutboundSpec {
            tag,
            protocol: "freedom".to_string(),
            send_through: None,
        })?;
        Ok(())
    }

    /// Drop the inbound/outbound pair for a tag.
    fn remove_node(&self, tag: &str) -> Result<()> {
        self.inbounds.remove_inbound(tag)?;
        self.outbounds.remove_handler(tag)?;
        Ok(())
    }

    fn add_node_users(&self, node: &NodeInfo, users: &[UserInfo]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        self.inbounds
            .add_users(&node.tag(), build_users(node, users))?;
        info!("added {} new users", users.len());
        Ok(())
    }
}

/// Convert panel users into engine users for the node's protocol.
fn build_users(node: &NodeInfo, users: &[UserInfo]) -> Vec<EngineUser> {
    users
        .iter()
        .map(|u| {
            let account = match node.node_type {
                NodeType::V2ray => {
                    if node.enable_vless {
                        UserAccount::Vless { uuid: u.uuid }
                    } else {
                        UserAccount::Vmess {
                            uuid: u.uuid,
                            alter_id: node.alter_id,
                        }
                    }
                }
                NodeType::Trojan => UserAccount::Trojan {
                    password: u.uuid.to_string(),
                },
                NodeType::Shadowsocks => UserAccount::Shadowsocks {
                    method: u.method.clone(),
                    password: u.passwd.clone(),
                },
            };
            EngineUser {
                email: u.email.clone(),
                level: 0,
                account,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClientInfo, DetectResult, DetectRule, NodeStatus};
    use crate::config::{ApiConfig, Config};
    use crate::engine::{MemoryInboundRegistry, MemoryOutboundRegistry, StatsRegistry};
    use crate::limiter::Admission;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockApi {
        node_info: Mutex<NodeInfo>,
        users: Mutex<Vec<UserInfo>>,
        rules: Mutex<Vec<DetectRule>>,
        reported_traffic: Mutex<Vec<Vec<UserTraffic>>>,
        reported_online: Mutex<Vec<Vec<OnlineUser>>>,
        reported_illegal: Mutex<Vec<Vec<DetectResult>>>,
        status_reports: AtomicU32,
    }

    impl MockApi {
        fn new(node_info: NodeInfo, users: Vec<UserInfo>) -> Arc<Self> {
            Arc::new(Self {
                node_info: Mutex::new(node_info),
                users: Mutex::new(users),
                rules: Mutex::new(Vec::new()),
                reported_traffic: Mutex::new(Vec::new()),
                reported_online: Mutex::new(Vec::new()),
                reported_illegal: Mutex::new(Vec::new()),
                status_reports: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Api for MockApi {
        fn describe(&self) -> ClientInfo {
            ClientInfo {
                api_host: "mock".to_string(),
                node_id: 1,
                key: "k".to_string(),
                node_type: NodeType::V2ray,
            }
        }

        async fn get_node_info(&self) -> Result<NodeInfo> {
            Ok(self.node_info.lock().clone())
        }

        async fn get_user_list(&self) -> Result<Vec<UserInfo>> {
            Ok(self.users.lock().clone())
        }

        async fn get_node_rules(&self) -> Result<Vec<DetectRule>> {
            Ok(self.rules.lock().clone())
        }

        async fn report_node_status(&self, _status: &NodeStatus) -> Result<()> {
            self.status_reports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
            self.reported_traffic.lock().push(traffic.to_vec());
            Ok(())
        }

        async fn report_node_online_users(&self, online: &[OnlineUser]) -> Result<()> {
            self.reported_online.lock().push(online.to_vec());
            Ok(())
        }

        async fn report_illegal(&self, results: &[DetectResult]) -> Result<()> {
            self.reported_illegal.lock().push(results.to_vec());
            Ok(())
        }
    }

    /// Inbound registry wrapper counting user add/remove calls.
    struct CountingInbounds {
        inner: Arc<MemoryInboundRegistry>,
        added: Mutex<Vec<Vec<String>>>,
        removed: Mutex<Vec<Vec<String>>>,
    }

    impl CountingInbounds {
        fn new(inner: Arc<MemoryInboundRegistry>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                added: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }
    }

    impl InboundManager for CountingInbounds {
        fn add_inbound(&self, spec: InboundSpec) -> Result<()> {
            self.inner.add_inbound(spec)
        }

        fn remove_inbound(&self, tag: &str) -> Result<()> {
            self.inner.remove_inbound(tag)
        }

        fn add_users(&self, tag: &str, users: Vec<EngineUser>) -> Result<()> {
            self.added
                .lock()
                .push(users.iter().map(|u| u.email.clone()).collect());
            self.inner.add_users(tag, users)
        }

        fn remove_users(&self, tag: &str, emails: &[String]) -> Result<()> {
            self.removed.lock().push(emails.to_vec());
            self.inner.remove_users(tag, emails)
        }
    }

    fn node(port: u16) -> NodeInfo {
        NodeInfo {
            node_type: NodeType::V2ray,
            node_id: 1,
            port,
            speed_limit: 0,
            ..Default::default()
        }
    }

    fn user(uid: i64, email: &str) -> UserInfo {
        UserInfo {
            uid,
            email: email.to_string(),
            ..Default::default()
        }
    }

    fn config() -> Config {
        Config::from_json(
            r#"{
                "api": {
                    "api_host": "https://panel.example.com",
                    "api_key": "secret",
                    "node_id": 1,
                    "node_type": "V2ray"
                },
                "update_periodic": 60
            }"#,
        )
        .unwrap()
    }

    struct Fixture {
        controller: Arc<Controller>,
        api: Arc<MockApi>,
        inbounds: Arc<CountingInbounds>,
        registry: Arc<MemoryInboundRegistry>,
        outbounds: Arc<MemoryOutboundRegistry>,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
        stats: Arc<StatsRegistry>,
    }

    fn fixture(node_info: NodeInfo, users: Vec<UserInfo>) -> Fixture {
        let api = MockApi::new(node_info, users);
        let registry = Arc::new(MemoryInboundRegistry::new());
        let inbounds = CountingInbounds::new(Arc::clone(&registry));
        let outbounds = Arc::new(MemoryOutboundRegistry::new());
        let limiter = Arc::new(Limiter::new());
        let rules = Arc::new(RuleManager::new());
        let stats = Arc::new(StatsRegistry::new());
        let controller = Arc::new(Controller::new(
            config(),
            api.clone(),
            inbounds.clone(),
            outbounds.clone(),
            limiter.clone(),
            rules.clone(),
            stats.clone(),
            None,
        ));
        Fixture {
            controller,
            api,
            inbounds,
            registry,
            outbounds,
            limiter,
            rules,
            stats,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn bootstrap_registers_node_and_users() {
        let f = fixture(node(443), vec![user(1, "a@x"), user(2, "b@x")]);
        f.controller.bootstrap().await.unwrap();

        assert_eq!(f.registry.tags(), vec!["V2ray_443".to_string()]);
        assert_eq!(
            f.registry.user_emails("V2ray_443"),
            vec!["a@x".to_string(), "b@x".to_string()]
        );
        assert!(f.outbounds.get_handler("V2ray_443").is_some());
        assert!(matches!(
            f.limiter.admit("V2ray_443", "a@x", ip("1.1.1.1")),
            Admission::Granted(None)
        ));
    }

    #[tokio::test]
    async fn user_diff_removes_and_adds_exactly_once() {
        let f = fixture(node(443), vec![user(1, "a@x"), user(2, "b@x")]);
        f.controller.bootstrap().await.unwrap();

        *f.api.users.lock() = vec![user(2, "b@x"), user(3, "c@x")];
        f.controller.node_info_monitor().await.unwrap();

        assert_eq!(
            *f.inbounds.removed.lock(),
            vec![vec!["a@x".to_string()]]
        );
        // One add during bootstrap, exactly one more for the diff.
        let added = f.inbounds.added.lock().clone();
        assert_eq!(added.len(), 2);
        assert_eq!(added[1], vec!["c@x".to_string()]);

        assert_eq!(
            f.registry.user_emails("V2ray_443"),
            vec!["b@x".to_string(), "c@x".to_string()]
        );
        assert!(matches!(
            f.limiter.admit("V2ray_443", "a@x", ip("1.1.1.1")),
            Admission::Unknown
        ));
        assert!(matches!(
            f.limiter.admit("V2ray_443", "c@x", ip("1.1.1.1")),
            Admission::Granted(None)
        ));
    }

    #[tokio::test]
    async fn unchanged_state_is_a_no_op_tick() {
        let f = fixture(node(443), vec![user(1, "a@x")]);
        f.controller.bootstrap().await.unwrap();
        f.controller.node_info_monitor().await.unwrap();

        assert_eq!(f.inbounds.added.lock().len(), 1);
        assert!(f.inbounds.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn node_change_swaps_tags_and_limiter() {
        let f = fixture(node(443), vec![user(1, "a@x")]);
        f.controller.bootstrap().await.unwrap();

        *f.api.node_info.lock() = node(8443);
        f.controller.node_info_monitor().await.unwrap();

        assert_eq!(f.registry.tags(), vec!["V2ray_8443".to_string()]);
        assert!(f.outbounds.get_handler("V2ray_443").is_none());
        assert!(f.outbounds.get_handler("V2ray_8443").is_some());
        assert!(matches!(
            f.limiter.admit("V2ray_443", "a@x", ip("1.1.1.1")),
            Admission::Unknown
        ));
        assert!(matches!(
            f.limiter.admit("V2ray_8443", "a@x", ip("1.1.1.1")),
            Admission::Granted(None)
        ));
    }

    #[tokio::test]
    async fn traffic_report_drains_counters() {
        let f = fixture(node(443), vec![user(1, "a@x"), user(2, "b@x")]);
        f.controller.bootstrap().await.unwrap();

        f.stats
            .get_or_register(&uplink_counter_name("a@x"))
            .add(100);
        f.stats
            .get_or_register(&downlink_counter_name("a@x"))
            .add(900);

        f.controller.user_info_monitor().await.unwrap();

        let reports = f.api.reported_traffic.lock().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0],
            vec![UserTraffic {
                uid: 1,
                email: "a@x".to_string(),
                upload: 100,
                download: 900,
            }]
        );

        // Counters were reset, so a quiet tick reports nothing.
        f.controller.user_info_monitor().await.unwrap();
        assert_eq!(f.api.reported_traffic.lock().len(), 1);
        assert_eq!(f.api.status_reports.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn online_devices_and_rule_hits_are_reported() {
        let f = fixture(node(443), vec![user(7, "a@x")]);
        f.controller.bootstrap().await.unwrap();

        f.limiter.admit("V2ray_443", "a@x", ip("1.2.3.4"));

        *f.api.rules.lock() = vec![DetectRule {
            id: 5,
            pattern: r"bad\.example".to_string(),
        }];
        f.controller.node_info_monitor().await.unwrap();
        assert!(f.rules.detect("V2ray_443", "bad.example:80", "a@x"));

        f.controller.user_info_monitor().await.unwrap();

        let online = f.api.reported_online.lock().clone();
        assert_eq!(
            online,
            vec![vec![OnlineUser {
                uid: 7,
                ip: ip("1.2.3.4"),
            }]]
        );

        let illegal = f.api.reported_illegal.lock().clone();
        assert_eq!(illegal.len(), 1);
        assert_eq!(
            (illegal[0][0].uid, illegal[0][0].rule_id, illegal[0][0].count),
            (7, 5, 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_close_manage_both_periodics() {
        let f = fixture(node(443), vec![user(1, "a@x")]);
        f.controller.start().await.unwrap();
        assert_eq!(f.controller.tasks.lock().len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        f.controller.close().await;
        assert!(f.controller.tasks.lock().is_empty());

        // Closing twice is harmless.
        f.controller.close().await;
    }
}
