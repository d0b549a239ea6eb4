//! Remote management API
//!
//! Models mirrored from the panel wire format plus the [`Api`] trait the
//! controller reconciles against. A JSON-over-HTTP implementation lives
//! in [`http`]; tests substitute their own.

pub mod http;

pub use http::HttpApi;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Node protocol family. `Display` output feeds the inbound tag format
/// `"{NodeType}_{Port}"`, so the spellings are load-bearing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    V2ray,
    Trojan,
    Shadowsocks,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::V2ray => write!(f, "V2ray"),
            NodeType::Trojan => write!(f, "Trojan"),
            NodeType::Shadowsocks => write!(f, "Shadowsocks"),
        }
    }
}

/// Node description fetched from the panel. Change detection is whole-
/// record equality, so every field participates in `PartialEq`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u16,
    /// Default speed limit in bytes/sec; 0 means unlimited.
    pub speed_limit: u64,
    pub alter_id: u16,
    pub transport_protocol: String,
    pub host: String,
    pub path: String,
    pub enable_tls: bool,
    pub tls_type: String,
    pub enable_vless: bool,
}

impl NodeInfo {
    /// Inbound/outbound tag for this node: `"{NodeType}_{Port}"`.
    pub fn tag(&self) -> String {
        format!("{}_{}", self.node_type, self.port)
    }
}

/// One panel user. Diffed as a whole record each tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub uid: i64,
    pub email: String,
    pub passwd: String,
    pub port: u16,
    pub method: String,
    /// Bytes/sec; 0 inherits the node default.
    pub speed_limit: u64,
    /// Concurrent source IPs; 0 means uncapped.
    pub device_limit: u32,
    pub protocol: String,
    pub protocol_param: String,
    pub obfs: String,
    pub obfs_param: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStatus {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub uptime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineUser {
    pub uid: i64,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserTraffic {
    pub uid: i64,
    pub email: String,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub api_host: String,
    pub node_id: u32,
    pub key: String,
    pub node_type: NodeType,
}

/// A deny pattern as delivered by the panel; compiled by the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DetectRule {
    pub id: i32,
    pub pattern: String,
}

/// Accumulated rule hits for one (user, rule) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectResult {
    pub uid: i64,
    pub rule_id: i32,
    pub count: u64,
}

/// The remote management API the controller reconciles against.
#[async_trait]
pub trait Api: Send + Sync {
    fn describe(&self) -> ClientInfo;
    async fn get_node_info(&self) -> Result<NodeInfo>;
    async fn get_user_list(&self) -> Result<Vec<UserInfo>>;
    async fn get_node_rules(&self) -> Result<Vec<DetectRule>>;
    async fn report_node_status(&self, status: &NodeStatus) -> Result<()>;
    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()>;
    async fn report_node_online_users(&self, online: &[OnlineUser]) -> Result<()>;
    async fn report_illegal(&self, results: &[DetectResult]) -> Result<()>;
}
