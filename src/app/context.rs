//! Per-connection context
//!
//! One value carried along the dispatch path instead of a chain of
//! ambient context entries: who connected, through which inbound, what
//! sniffing policy applies, and the cancellation token shared with the
//! outbound handler.

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;

/// The authenticated user behind an inbound connection, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub uid: i64,
    pub email: String,
    pub level: u32,
}

/// Sniffing policy attached by the inbound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffingRequest {
    pub enabled: bool,
    /// Override the destination when the sniffed protocol starts with
    /// one of these prefixes.
    pub override_destination_for_protocol: Vec<String>,
    /// Never override to one of these domains.
    pub exclude_for_domain: Vec<String>,
}

#[derive(Clone)]
pub struct ConnectionContext {
    pub inbound_tag: String,
    pub source_ip: IpAddr,
    pub user: Option<SessionUser>,
    pub sniffing: SniffingRequest,
    pub skip_route_pick: bool,
    pub cancel: CancellationToken,
}

impl ConnectionContext {
    pub fn new(inbound_tag: impl Into<String>, source_ip: IpAddr) -> Self {
        Self {
            inbound_tag: inbound_tag.into(),
            source_ip,
            user: None,
            sniffing: SniffingRequest::default(),
            skip_route_pick: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user(mut self, user: SessionUser) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_sniffing(mut self, sniffing: SniffingRequest) -> Self {
        self.sniffing = sniffing;
        self
    }

    pub fn with_skip_route_pick(mut self, skip: bool) -> Self {
        self.skip_route_pick = skip;
        self
    }
}
