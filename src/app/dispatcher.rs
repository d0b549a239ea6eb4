//! Dispatcher - Core Execution Flow
//!
//! Every inbound connection passes through here:
//!
//! ```text
//! Dispatch(ctx, destination)
//!   ├── RuleManager.detect      → reject denied destinations
//!   ├── build link pair          → limiter / stats writer wrapping
//!   └── background task
//!         ├── sniff loop (TCP + sniffing enabled)
//!         └── routed_dispatch    → router → outbound handler
//! ```
//!
//! The caller keeps the inbound link; the background task exclusively
//! owns the outbound link and hands it off to the chosen handler.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::common::{BoxWriter, CachedReader, Destination, Link, Network, PipeReader, pipe, SCRATCH_SIZE};
use crate::engine::stats::{downlink_counter_name, uplink_counter_name};
use crate::engine::{
    OutboundHandler, OutboundManager, PolicyManager, Router, RoutingContext, StatWriter,
    StatsManager,
};
use crate::error::{Error, Result};
use crate::limiter::{Admission, Limiter, RateWriter};
use crate::rule::RuleManager;
use crate::sniff::{SniffResult, Sniffer};

use super::context::{ConnectionContext, SniffingRequest};
use super::metrics::{
    DISPATCH_DEVICE_REJECTS, DISPATCH_NO_HANDLER, DISPATCH_RULE_REJECTS, DISPATCH_TOTAL,
    SNIFF_RESULTS,
};

// ============================================================================
// Constants
// ============================================================================

/// Sniff attempts before giving up on classification.
const SNIFF_ATTEMPTS: u32 = 2;

// ============================================================================
// Dispatcher
// ============================================================================

/// Mediates every inbound connection between the proxy engine's inbound
/// side and its outbound handlers, enforcing per-user device caps, speed
/// limits and deny rules on the way.
pub struct Dispatcher {
    outbounds: Arc<dyn OutboundManager>,
    router: Option<Arc<dyn Router>>,
    policy: Arc<dyn PolicyManager>,
    stats: Arc<dyn StatsManager>,
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
}

/// The half that moves into the background task. The reader stays
/// concrete until the sniffing decision is made.
struct OutboundLink {
    reader: PipeReader,
    writer: BoxWriter,
}

impl Dispatcher {
    pub fn new(
        outbounds: Arc<dyn OutboundManager>,
        router: Option<Arc<dyn Router>>,
        policy: Arc<dyn PolicyManager>,
        stats: Arc<dyn StatsManager>,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
    ) -> Self {
        Self {
            outbounds,
            router,
            policy,
            stats,
            limiter,
            rules,
        }
    }

    /// Admit one connection headed for `destination`. Returns the
    /// inbound link; sniffing and routing continue in the background.
    ///
    /// Only [`Error::RejectedByRule`] surfaces to the caller; every
    /// other failure is absorbed so one connection cannot take down its
    /// neighbors. Panics on an invalid destination, which is a
    /// programmer error on the inbound side.
    pub fn dispatch(
        self: &Arc<Self>,
        ctx: ConnectionContext,
        destination: Destination,
    ) -> Result<Link> {
        assert!(
            destination.is_valid(),
            "dispatcher: invalid destination {destination}"
        );
        DISPATCH_TOTAL.inc();

        if let Some(user) = &ctx.user {
            let target = destination.address.to_string();
            if self.rules.detect(&ctx.inbound_tag, &target, &user.email) {
                DISPATCH_RULE_REJECTS.inc();
                warn!(
                    user = %user.email,
                    destination = %target,
                    "access rejected by rule"
                );
                return Err(Error::RejectedByRule);
            }
        }

        let (inbound, outbound) = self.build_links(&ctx);

        if destination.network != Network::Tcp || !ctx.sniffing.enabled {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                let link = Link {
                    reader: Box::new(outbound.reader),
                    writer: outbound.writer,
                };
                dispatcher.routed_dispatch(ctx, link, destination).await;
            });
        } else {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                let mut destination = destination;
                let mut reader = CachedReader::new(outbound.reader);
                match sniff(&ctx, &mut reader).await {
                    Ok(result) => {
                        SNIFF_RESULTS.with_label_values(&[result.protocol()]).inc();
                        if should_override(&result, &ctx.sniffing) {
                            debug!(domain = result.domain(), "sniffed domain");
                            destination.override_host(result.domain());
                        }
                    }
                    Err(e) => debug!("sniffing abandoned: {}", e),
                }
                let link = Link {
                    reader: Box::new(reader),
                    writer: outbound.writer,
                };
                dispatcher.routed_dispatch(ctx, link, destination).await;
            });
        }

        Ok(inbound)
    }

    /// Build the two pipe pairs and apply per-user wrapping: device-cap
    /// admission, rate pacing, traffic counters.
    fn build_links(&self, ctx: &ConnectionContext) -> (Link, OutboundLink) {
        let (mut uplink_reader, uplink_writer) = pipe();
        let (mut downlink_reader, downlink_writer) = pipe();

        let mut inbound_writer: BoxWriter = Box::new(uplink_writer);
        let mut outbound_writer: BoxWriter = Box::new(downlink_writer);

        if let Some(user) = ctx.user.as_ref().filter(|u| !u.email.is_empty()) {
            match self
                .limiter
                .admit(&ctx.inbound_tag, &user.email, ctx.source_ip)
            {
                Admission::Rejected => {
                    DISPATCH_DEVICE_REJECTS.inc();
                    warn!(user = %user.email, "devices reach the limit");
                    // Kill all four endpoints; the dead links still flow
                    // through dispatch so the caller sees no error.
                    downlink_reader.interrupt();
                    uplink_reader.interrupt();
                }
                Admission::Granted(Some(bucket)) => {
                    inbound_writer =
                        Box::new(RateWriter::new(inbound_writer, Arc::clone(&bucket)));
                    outbound_writer = Box::new(RateWriter::new(outbound_writer, bucket));
                }
                Admission::Granted(None) | Admission::Unknown => {}
            }

            let policy = self.policy.for_level(user.level);
            if policy.stats.user_uplink {
                let counter = self
                    .stats
                    .get_or_register(&uplink_counter_name(&user.email));
                inbound_writer = Box::new(StatWriter::new(inbound_writer, counter));
            }
            if policy.stats.user_downlink {
                let counter = self
                    .stats
                    .get_or_register(&downlink_counter_name(&user.email));
                outbound_writer = Box::new(StatWriter::new(outbound_writer, counter));
            }
        }

        (
            Link {
                reader: Box::new(downlink_reader),
                writer: inbound_writer,
            },
            OutboundLink {
                reader: uplink_reader,
                writer: outbound_writer,
            },
        )
    }

    /// Pick a route, resolve the handler, log the detour and hand the
    /// link over. Ownership of the link transfers to the handler.
    async fn routed_dispatch(&self, ctx: ConnectionContext, link: Link, destination: Destination) {
        let mut handler: Option<Arc<dyn OutboundHandler>> = None;
        let mut routed = false;

        if let Some(router) = self.router.as_ref().filter(|_| !ctx.skip_route_pick) {
            let routing_ctx = RoutingContext {
                inbound_tag: &ctx.inbound_tag,
                destination: &destination,
                user_email: ctx.user.as_ref().map(|u| u.email.as_str()),
            };
            match router.pick_route(&routing_ctx) {
                Ok(route) => {
                    routed = true;
                    match self.outbounds.get_handler(&route.outbound_tag) {
                        Some(h) => {
                            debug!(out_tag = %route.outbound_tag, %destination, "taking detour");
                            handler = Some(h);
                        }
                        None => warn!(out_tag = %route.outbound_tag, "non existing outbound tag"),
                    }
                }
                Err(_) => debug!(%destination, "default route"),
            }
        }

        let handler = match handler.or_else(|| self.outbounds.get_default_handler()) {
            Some(h) => h,
            None => {
                DISPATCH_NO_HANDLER.inc();
                warn!("default outbound handler not exist");
                link.close().await;
                return;
            }
        };

        let out_tag = handler.tag();
        if !out_tag.is_empty() {
            info!(
                target: "access",
                detour = %detour_label(&ctx.inbound_tag, out_tag, routed),
                %destination,
                "accepted"
            );
        }

        handler.dispatch(ctx, link, destination).await;
    }
}

/// Access-log detour string: `in -> out` when the router picked the
/// route, `in >> out` when we fell through to the default handler.
fn detour_label(in_tag: &str, out_tag: &str, routed: bool) -> String {
    let sep = if routed { "->" } else { ">>" };
    if in_tag.is_empty() {
        out_tag.to_string()
    } else {
        format!("{} {} {}", in_tag, sep, out_tag)
    }
}

/// Override only when the sniffed protocol is opted in and the domain is
/// not excluded.
fn should_override(result: &SniffResult, request: &SniffingRequest) -> bool {
    if request
        .exclude_for_domain
        .iter()
        .any(|d| d == result.domain())
    {
        return false;
    }
    request
        .override_destination_for_protocol
        .iter()
        .any(|p| result.protocol().starts_with(p.as_str()))
}

/// Bounded sniff loop: at most [`SNIFF_ATTEMPTS`] cache-and-classify
/// rounds, each observing cancellation. Never blocks dispatch for more
/// than the attempts' cache deadlines.
async fn sniff(ctx: &ConnectionContext, reader: &mut CachedReader) -> Result<SniffResult> {
    let mut payload = BytesMut::with_capacity(SCRATCH_SIZE);
    let mut sniffer = Sniffer::new();
    let mut attempts = 0u32;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempts += 1;
        if attempts > SNIFF_ATTEMPTS {
            return Err(Error::SniffTimeout);
        }

        reader.cache(&mut payload).await;
        if !payload.is_empty() {
            if let Ok(result) = sniffer.sniff(&payload) {
                return Ok(result);
            }
        }
        if payload.len() >= SCRATCH_SIZE {
            return Err(Error::UnknownContent);
        }
    }
}
