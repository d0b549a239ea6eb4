//! RuleManager - per-inbound deny patterns with hit accounting
//!
//! The controller feeds panel-supplied patterns in; the dispatcher asks
//! whether a destination is denied for a given user. Matches are counted
//! per (uid, rule) and drained by the reporter.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::warn;

use crate::api::{DetectResult, DetectRule, UserInfo};

struct CompiledRule {
    id: i32,
    pattern: Regex,
}

pub struct RuleManager {
    /// tag → ordered, compiled ruleset
    rules: RwLock<HashMap<String, Arc<Vec<CompiledRule>>>>,
    /// tag → email → uid, for keying hit counters
    users: RwLock<HashMap<String, HashMap<String, i64>>>,
    /// (uid, rule id) → hits since last drain
    hits: Mutex<HashMap<(i64, i32), u64>>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the ruleset for `tag`. Patterns that fail to compile are
    /// skipped so one bad rule cannot poison the set.
    pub fn update_rules(&self, tag: &str, rules: &[DetectRule]) {
        let compiled: Vec<CompiledRule> = rules
            .iter()
            .filter_map(|rule| match Regex::new(&rule.pattern) {
                Ok(pattern) => Some(CompiledRule {
                    id: rule.id,
                    pattern,
                }),
                Err(e) => {
                    warn!(tag, rule = rule.id, "skipping invalid rule pattern: {}", e);
                    None
                }
            })
            .collect();
        self.rules.write().insert(tag.to_string(), Arc::new(compiled));
    }

    /// Apply a user diff to the uid-resolution map for `tag`.
    pub fn update_users(&self, tag: &str, added: &[UserInfo], deleted: &[String]) {
        let mut users = self.users.write();
        let map = users.entry(tag.to_string()).or_default();
        for email in deleted {
            map.remove(email);
        }
        for user in added {
            map.insert(user.email.clone(), user.uid);
        }
    }

    /// Drop the ruleset and user map for `tag`.
    pub fn delete_inbound(&self, tag: &str) {
        self.rules.write().remove(tag);
        self.users.write().remove(tag);
    }

    /// True when `destination` matches a deny rule for `tag`. The first
    /// matching rule wins and its (uid, rule) counter is incremented;
    /// emails with no known uid still reject but record nothing.
    pub fn detect(&self, tag: &str, destination: &str, email: &str) -> bool {
        let Some(rules) = self.rules.read().get(tag).cloned() else {
            return false;
        };
        for rule in rules.iter() {
            if rule.pattern.is_match(destination) {
                let uid = self
                    .users
                    .read()
                    .get(tag)
                    .and_then(|m| m.get(email))
                    .copied();
                if let Some(uid) = uid {
                    *self.hits.lock().entry((uid, rule.id)).or_insert(0) += 1;
                }
                return true;
            }
        }
        false
    }

    /// Return and clear the accumulated hit counters.
    pub fn drain_hits(&self) -> Vec<DetectResult> {
        self.hits
            .lock()
            .drain()
            .map(|((uid, rule_id), count)| DetectResult {
                uid,
                rule_id,
                count,
            })
            .collect()
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}
