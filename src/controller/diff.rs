//! User-list diffing
//!
//! Whole-record set difference: a user whose attributes changed shows up
//! as deleted-then-added, which forces the engine entry and limiter
//! bucket to be rebuilt with the new values.

use std::collections::HashSet;

use crate::api::UserInfo;

/// Returns `(deleted, added)` between two user lists.
pub fn diff_users(old: &[UserInfo], new: &[UserInfo]) -> (Vec<UserInfo>, Vec<UserInfo>) {
    let old_set: HashSet<&UserInfo> = old.iter().collect();
    let new_set: HashSet<&UserInfo> = new.iter().collect();

    let deleted = old
        .iter()
        .filter(|u| !new_set.contains(*u))
        .cloned()
        .collect();
    let added = new
        .iter()
        .filter(|u| !old_set.contains(*u))
        .cloned()
        .collect();
    (deleted, added)
}
