//! Limiter - per-user speed buckets and device caps
//!
//! One record per inbound tag, holding a token bucket and an online-IP
//! table per user email. The dispatcher consults it on every connection
//! ([`Limiter::admit`]); the controller rebuilds it as the panel's user
//! list changes. All operations are safe under concurrent call; the
//! admit path takes only read locks on the registry maps.

mod bucket;

pub use bucket::{RateWriter, TokenBucket};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::api::UserInfo;

/// An online device not seen for this long no longer counts against the
/// device cap.
pub const ONLINE_IDLE_TTL: Duration = Duration::from_secs(60);

/// Outcome of admitting a (tag, email, ip) triple.
#[derive(Clone)]
pub enum Admission {
    /// The (tag, email) pair is not tracked: unlimited, not rejected.
    Unknown,
    /// Admitted; `Some` carries the bucket to pace writers with.
    Granted(Option<Arc<TokenBucket>>),
    /// Too many concurrent devices for this user.
    Rejected,
}

struct UserEntry {
    device_limit: u32,
    bucket: Option<Arc<TokenBucket>>,
    online: Mutex<HashMap<IpAddr, Instant>>,
}

impl UserEntry {
    fn new(default_speed: u64, user: &UserInfo) -> Self {
        let speed = if user.speed_limit > 0 {
            user.speed_limit
        } else {
            default_speed
        };
        Self {
            device_limit: user.device_limit,
            bucket: (speed > 0).then(|| Arc::new(TokenBucket::new(speed, speed))),
            online: Mutex::new(HashMap::new()),
        }
    }
}

struct InboundLimiter {
    default_speed: u64,
    users: RwLock<HashMap<String, Arc<UserEntry>>>,
}

/// Registry of per-inbound limiter records
pub struct Limiter {
    inbounds: RwLock<HashMap<String, Arc<InboundLimiter>>>,
}

impl Limiter {
    pub fn new() -> Self {
        Self {
            inbounds: RwLock::new(HashMap::new()),
        }
    }

    /// Create or replace the record for `tag`, preallocating one bucket
    /// per user with an effective (user or default) speed limit.
    pub fn add_inbound(&self, tag: &str, default_speed: u64, users: &[UserInfo]) {
        let entries = users
            .iter()
            .map(|u| (u.email.clone(), Arc::new(UserEntry::new(default_speed, u))))
            .collect();
        let inbound = Arc::new(InboundLimiter {
            default_speed,
            users: RwLock::new(entries),
        });
        self.inbounds.write().insert(tag.to_string(), inbound);
    }

    /// Drop the record for `tag` with its buckets and online tables.
    pub fn delete_inbound(&self, tag: &str) {
        self.inbounds.write().remove(tag);
    }

    /// Apply a user diff to an existing inbound record.
    pub fn update_users(&self, tag: &str, added: &[UserInfo], deleted: &[String]) {
        let Some(inbound) = self.inbounds.read().get(tag).cloned() else {
            return;
        };
        let mut users = inbound.users.write();
        for email in deleted {
            users.remove(email);
        }
        for user in added {
            users.insert(
                user.email.clone(),
                Arc::new(UserEntry::new(inbound.default_speed, user)),
            );
        }
    }

    /// Admit one connection for (tag, email) from `ip`, refreshing the
    /// user's online table and enforcing the device cap.
    pub fn admit(&self, tag: &str, email: &str, ip: IpAddr) -> Admission {
        let Some(inbound) = self.inbounds.read().get(tag).cloned() else {
            return Admission::Unknown;
        };
        let Some(entry) = inbound.users.read().get(email).cloned() else {
            return Admission::Unknown;
        };

        let mut online = entry.online.lock();
        let now = Instant::now();
        let newly_seen = !online.contains_key(&ip);
        online.insert(ip, now);
        online.retain(|_, seen| now.duration_since(*seen) < ONLINE_IDLE_TTL);

        if entry.device_limit > 0 && online.len() > entry.device_limit as usize && newly_seen {
            online.remove(&ip);
            debug!(tag, email, %ip, limit = entry.device_limit, "device cap reached");
            return Admission::Rejected;
        }
        Admission::Granted(entry.bucket.clone())
    }

    /// Snapshot of the online tables for `tag`. Stale entries are
    /// evicted during the walk; live ones are left intact, so repeated
    /// calls without traffic return the same or shrinking sets.
    pub fn online_devices(&self, tag: &str) -> Vec<(String, IpAddr)> {
        let Some(inbound) = self.inbounds.read().get(tag).cloned() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut devices = Vec::new();
        for (email, entry) in inbound.users.read().iter() {
            let mut online = entry.online.lock();
            online.retain(|_, seen| now.duration_since(*seen) < ONLINE_IDLE_TTL);
            for ip in online.keys() {
                devices.push((email.clone(), *ip));
            }
        }
        devices
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}
