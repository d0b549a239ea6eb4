//! Nodium - control and data-plane glue for a multi-tenant proxy node
//!
//! # Architecture
//!
//! ```text
//! inbound connection ──► Dispatcher ──► Router ──► OutboundHandler
//!                           │ ▲
//!             Limiter ◄─────┘ └────► RuleManager
//!                ▲                        ▲
//!                └──── Controller ────────┘
//!                          │
//!                   management API (periodic reconciliation)
//! ```
//!
//! ## Core Principles
//!
//! - The dispatcher owns per-connection state; the controller owns the
//!   "what inbounds/outbounds exist right now" state machine
//! - Limiter and RuleManager are shared singletons, constructed once at
//!   node startup and passed as explicit dependencies
//! - The proxy engine (listeners, protocol codecs, outbound transports)
//!   stays behind the traits in [`engine`]
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, pipes, links, cached reader
//! ├── sniff/           # TLS / HTTP content sniffing
//! ├── limiter/         # speed buckets + device caps
//! ├── rule/            # deny-rule engine
//! ├── engine/          # proxy-engine collaborator seams
//! ├── app/             # Dispatcher, connection context, metrics
//! ├── controller/      # periodic reconciliation
//! └── api/             # management API models + client
//! ```

// Core types
pub mod common;
pub mod error;

// Data plane
pub mod app;
pub mod engine;
pub mod limiter;
pub mod rule;
pub mod sniff;

// Control plane
pub mod api;
pub mod cert;
pub mod config;
pub mod controller;
pub mod system;

// Re-exports for convenience
pub use common::{Address, Destination, Link, Network};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::{ConnectionContext, Dispatcher, SessionUser, SniffingRequest};
pub use controller::Controller;
pub use limiter::Limiter;
pub use rule::RuleManager;
