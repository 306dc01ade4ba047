use crate::error::Result;
use crate::store::KvStore;
use crate::types::{ActiveUser, AuditEntry};
use crate::utils::format_datetime;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Most recent entries kept per user; the oldest are evicted first.
pub const USER_LOG_CAP: usize = 100;
/// Per-user logs disappear after a week of inactivity.
pub const USER_LOG_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const ACTIVE_USERS_SET: &str = "active_users";
const RECENT_LIMIT: usize = 10;
const ACTIVE_LIMIT: usize = 10;
const ACTIVE_WINDOW_SECS: i64 = 24 * 60 * 60;

fn user_log_key(user_id: u64) -> String {
    format!("user_requests:{}", user_id)
}

/// Append-only per-user request log plus a recency-ranked active-user
/// index, both living in the shared store.
pub struct AuditLog {
    store: Arc<dyn KvStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Record one admitted request. Failures here must never fail the
    /// request itself; they are logged and swallowed. Returns whether the
    /// write went through, so callers can count failures.
    pub fn record(&self, entry: &AuditEntry) -> bool {
        if let Err(e) = self.try_record(entry) {
            error!(user_id = entry.user_id, "Failed to record audit entry: {}", e);
            return false;
        }
        true
    }

    fn try_record(&self, entry: &AuditEntry) -> Result<()> {
        let encoded = serde_json::to_string(entry)?;
        self.store.list_push_front(
            &user_log_key(entry.user_id),
            encoded,
            USER_LOG_CAP,
            USER_LOG_TTL,
        )?;
        self.store.score_add(
            ACTIVE_USERS_SET,
            &entry.user_id.to_string(),
            entry.timestamp,
        )?;
        Ok(())
    }

    /// Latest requests for one user, newest first, at most ten.
    pub fn recent_requests(&self, user_id: u64) -> Result<Vec<AuditEntry>> {
        let raw = self
            .store
            .list_range(&user_log_key(user_id), 0, RECENT_LIMIT - 1)?;

        // Rows that fail to decode are skipped rather than failing the query
        Ok(raw
            .iter()
            .filter_map(|row| serde_json::from_str(row).ok())
            .collect())
    }

    /// Users active within the last 24 hours, most recent first, at most
    /// ten, each with its stored request count.
    pub fn active_users(&self, now: i64) -> Result<Vec<ActiveUser>> {
        let rows = self.store.score_rev_range(
            ACTIVE_USERS_SET,
            now,
            now - ACTIVE_WINDOW_SECS,
            ACTIVE_LIMIT,
        )?;

        let mut out = Vec::with_capacity(rows.len());
        for (member, last_activity) in rows {
            let request_count = member
                .parse::<u64>()
                .ok()
                .map(|id| self.store.list_len(&user_log_key(id)).unwrap_or(0))
                .unwrap_or(0);
            out.push(ActiveUser {
                user_id: member,
                last_activity: format_datetime(last_activity),
                request_count,
            });
        }
        Ok(out)
    }
}
