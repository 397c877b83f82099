//! `ThrottleStore` trait: durable "last replied to sender at T" history.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// One accepted reply to a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub id: i64,
    /// Normalized sender address (angle brackets stripped, lowercased).
    pub sender: String,
    pub replied_at: DateTime<Utc>,
}

/// Backend-agnostic rebound-protection store.
#[async_trait]
pub trait ThrottleStore: Send + Sync {
    /// Decide whether a reply to `sender` must be suppressed.
    ///
    /// Runs as one transaction: the most recent record within `window`
    /// suppresses (returns `true`, no writes); otherwise stale records for
    /// the sender are deleted and a fresh one stamped `now` is inserted
    /// before returning `false`.
    async fn should_suppress(
        &self,
        sender: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Most recent record for a sender, if any.
    async fn last_reply(&self, sender: &str) -> Result<Option<ThrottleRecord>, DatabaseError>;

    /// Unconditionally record a reply. Returns the new record id.
    async fn insert(&self, sender: &str, at: DateTime<Utc>) -> Result<i64, DatabaseError>;

    /// Delete every record older than `older_than`. Returns the number deleted.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError>;

    /// Total number of records.
    async fn count(&self) -> Result<usize, DatabaseError>;
}

/// Normalize a sender address into a throttle key.
pub fn normalize_sender(sender: &str) -> String {
    let trimmed = sender.trim();
    let inner = match (trimmed.find('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_brackets_and_case() {
        assert_eq!(normalize_sender("Alice <Alice@Example.com>"), "alice@example.com");
        assert_eq!(normalize_sender("  bob@x.org "), "bob@x.org");
        assert_eq!(normalize_sender("<c@d.e>"), "c@d.e");
    }
}
