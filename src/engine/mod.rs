//! Proxy engine collaborator interfaces
//!
//! The embedded proxy core (listeners, protocol codecs, transports) is
//! an external collaborator. This module defines the seams nodium talks
//! to it through: outbound handler lookup, inbound/user registration,
//! routing, per-level policy and named traffic counters. In-memory
//! reference implementations live in [`registry`] and [`stats`]; a real
//! engine binds its own.

pub mod registry;
pub mod stats;

pub use registry::{DrainOutbound, MemoryInboundRegistry, MemoryOutboundRegistry, StaticRouter};
pub use stats::{StatCounter, StatWriter, StatsManager, StatsRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::app::ConnectionContext;
use crate::common::{Destination, Link};
use crate::error::Result;

/// Credentials attached to an engine user, by node protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAccount {
    Vmess { uuid: Uuid, alter_id: u16 },
    Vless { uuid: Uuid },
    Trojan { password: String },
    Shadowsocks { method: String, password: String },
}

/// A user as the proxy engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineUser {
    pub email: String,
    pub level: u32,
    pub account: UserAccount,
}

/// Listener description handed to the engine when a node appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSpec {
    pub tag: String,
    pub listen_ip: String,
    pub port: u16,
    pub protocol: String,
    pub transport: String,
    pub host: String,
    pub path: String,
    pub tls: bool,
}

/// Sender description created and destroyed together with its inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSpec {
    pub tag: String,
    pub protocol: String,
    pub send_through: Option<String>,
}

/// A configured sender. Takes ownership of the link and relays until
/// both directions close.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;
    async fn dispatch(&self, ctx: ConnectionContext, link: Link, destination: Destination);
}

pub trait OutboundManager: Send + Sync {
    fn get_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>>;
    fn get_default_handler(&self) -> Option<Arc<dyn OutboundHandler>>;
    fn add_handler(&self, spec: OutboundSpec) -> Result<()>;
    fn remove_handler(&self, tag: &str) -> Result<()>;
}

/// Inbound-side registration. All operations are idempotent: re-adding
/// replaces, removing something absent is not an error — a failed
/// controller tick must be safely retryable.
pub trait InboundManager: Send + Sync {
    fn add_inbound(&self, spec: InboundSpec) -> Result<()>;
    fn remove_inbound(&self, tag: &str) -> Result<()>;
    fn add_users(&self, tag: &str, users: Vec<EngineUser>) -> Result<()>;
    fn remove_users(&self, tag: &str, emails: &[String]) -> Result<()>;
}

/// What the router sees of a connection.
pub struct RoutingContext<'a> {
    pub inbound_tag: &'a str,
    pub destination: &'a Destination,
    pub user_email: Option<&'a str>,
}

pub struct Route {
    pub outbound_tag: String,
}

pub trait Router: Send + Sync {
    fn pick_route(&self, ctx: &RoutingContext<'_>) -> Result<Route>;
}

/// Per-level connection policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsPolicy {
    pub user_uplink: bool,
    pub user_downlink: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Policy {
    pub stats: StatsPolicy,
}

pub trait PolicyManager: Send + Sync {
    fn for_level(&self, level: u32) -> Policy;
}

/// Counts user traffic on every level.
pub struct DefaultPolicyManager;

impl PolicyManager for DefaultPolicyManager {
    fn for_level(&self, _level: u32) -> Policy {
        Policy {
            stats: StatsPolicy {
                user_uplink: true,
                user_downlink: true,
            },
        }
    }
}
