//! In-memory reference implementations of the engine seams
//!
//! A real deployment backs these traits with the embedded proxy core.
//! The in-memory registries record the same state transitions, which is
//! all the controller and the test suite need.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::app::ConnectionContext;
use crate::common::{Destination, Link};
use crate::error::Result;

use super::{
    EngineUser, InboundManager, InboundSpec, OutboundHandler, OutboundManager, OutboundSpec,
    Route, Router, RoutingContext,
};

/// Outbound stand-in that consumes the link and discards it.
pub struct DrainOutbound {
    tag: String,
}

impl DrainOutbound {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl OutboundHandler for DrainOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, _ctx: ConnectionContext, mut link: Link, destination: Destination) {
        debug!(tag = %self.tag, %destination, "draining link");
        let _ = tokio::io::copy(&mut link.reader, &mut tokio::io::sink()).await;
        let _ = link.writer.shutdown().await;
    }
}

/// Tag-keyed outbound handler registry. The first handler registered
/// becomes the default until an explicit override.
pub struct MemoryOutboundRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn OutboundHandler>>>,
    default_tag: RwLock<Option<String>>,
}

impl MemoryOutboundRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_tag: RwLock::new(None),
        }
    }

    pub fn insert(&self, handler: Arc<dyn OutboundHandler>) {
        let tag = handler.tag().to_string();
        self.handlers.write().insert(tag.clone(), handler);
        let mut default = self.default_tag.write();
        if default.is_none() {
            *default = Some(tag);
        }
    }

    pub fn set_default(&self, tag: &str) {
        *self.default_tag.write() = Some(tag.to_string());
    }

    pub fn tags(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl Default for MemoryOutboundRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundManager for MemoryOutboundRegistry {
    fn get_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.read().get(tag).cloned()
    }

    fn get_default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        let default = self.default_tag.read().clone()?;
        self.get_handler(&default)
    }

    fn add_handler(&self, spec: OutboundSpec) -> Result<()> {
        debug!(tag = %spec.tag, protocol = %spec.protocol, "registering outbound");
        self.insert(Arc::new(DrainOutbound::new(spec.tag)));
        Ok(())
    }

    fn remove_handler(&self, tag: &str) -> Result<()> {
        self.handlers.write().remove(tag);
        let mut default = self.default_tag.write();
        if default.as_deref() == Some(tag) {
            *default = None;
        }
        Ok(())
    }
}

struct InboundEntry {
    spec: InboundSpec,
    users: HashMap<String, EngineUser>,
}

/// Records which inbounds and users the controller has registered.
pub struct MemoryInboundRegistry {
    inbounds: RwLock<HashMap<String, InboundEntry>>,
}

impl MemoryInboundRegistry {
    pub fn new() -> Self {
        Self {
            inbounds: RwLock::new(HashMap::new()),
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.inbounds.read().keys().cloned().collect()
    }

    pub fn user_emails(&self, tag: &str) -> Vec<String> {
        let mut emails: Vec<String> = self
            .inbounds
            .read()
            .get(tag)
            .map(|e| e.users.keys().cloned().collect())
            .unwrap_or_default();
        emails.sort();
        emails
    }

    pub fn spec(&self, tag: &str) -> Option<InboundSpec> {
        self.inbounds.read().get(tag).map(|e| e.spec.clone())
    }
}

impl Default for MemoryInboundRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundManager for MemoryInboundRegistry {
    fn add_inbound(&self, spec: InboundSpec) -> Result<()> {
        debug!(tag = %spec.tag, port = spec.port, "registering inbound");
        self.inbounds.write().insert(
            spec.tag.clone(),
            InboundEntry {
                spec,
                users: HashMap::new(),
            },
        );
        Ok(())
    }

    fn remove_inbound(&self, tag: &str) -> Result<()> {
        self.inbounds.write().remove(tag);
        Ok(())
    }

    fn add_users(&self, tag: &str, users: Vec<EngineUser>) -> Result<()> {
        let mut inbounds = self.inbounds.write();
        let entry = inbounds
            .get_mut(tag)
            .ok_or_else(|| crate::error::Error::Config(format!("no such inbound: {}", tag)))?;
        for user in users {
            entry.users.insert(user.email.clone(), user);
        }
        Ok(())
    }

    fn remove_users(&self, tag: &str, emails: &[String]) -> Result<()> {
        if let Some(entry) = self.inbounds.write().get_mut(tag) {
            for email in emails {
                entry.users.remove(email);
            }
        }
        Ok(())
    }
}

/// Router that sends every connection to one outbound.
pub struct StaticRouter {
    outbound_tag: String,
}

impl StaticRouter {
    pub fn new(outbound_tag: impl Into<String>) -> Self {
        Self {
            outbound_tag: outbound_tag.into(),
        }
    }
}

impl Router for StaticRouter {
    fn pick_route(&self, _ctx: &RoutingContext<'_>) -> Result<Route> {
        Ok(Route {
            outbound_tag: self.outbound_tag.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UserAccount;

    fn spec(tag: &str) -> InboundSpec {
        InboundSpec {
            tag: tag.to_string(),
            listen_ip: "0.0.0.0".to_string(),
            port: 443,
            protocol: "vmess".to_string(),
            transport: "tcp".to_string(),
            host: String::new(),
            path: String::new(),
            tls: false,
        }
    }

    fn engine_user(email: &str) -> EngineUser {
        EngineUser {
            email: email.to_string(),
            level: 0,
            account: UserAccount::Trojan {
                password: "pw".to_string(),
            },
        }
    }

    #[test]
    fn inbound_ops_are_idempotent() {
        let registry = MemoryInboundRegistry::new();
        registry.add_inbound(spec("V2ray_443")).unwrap();
        registry.add_inbound(spec("V2ray_443")).unwrap();
        assert_eq!(registry.tags(), vec!["V2ray_443".to_string()]);

        registry
            .add_users("V2ray_443", vec![engine_user("a@x"), engine_user("b@x")])
            .unwrap();
        registry
            .remove_users("V2ray_443", &["a@x".to_string(), "ghost@x".to_string()])
            .unwrap();
        assert_eq!(registry.user_emails("V2ray_443"), vec!["b@x".to_string()]);

        registry.remove_inbound("V2ray_443").unwrap();
        registry.remove_inbound("V2ray_443").unwrap();
        assert!(registry.tags().is_empty());
    }

    #[test]
    fn first_outbound_is_default_until_removed() {
        let registry = MemoryOutboundRegistry::new();
        registry
            .add_handler(OutboundSpec {
                tag: "V2ray_443".to_string(),
                protocol: "freedom".to_string(),
                send_through: None,
            })
            .unwrap();
        assert_eq!(
            registry.get_default_handler().unwrap().tag(),
            "V2ray_443"
        );

        registry.remove_handler("V2ray_443").unwrap();
        assert!(registry.get_default_handler().is_none());
    }
}
