//! The demoted broker hint (spec.md §9): a transactional-outbox-shaped
//! record of "something changed" plus a publisher that turns it into a
//! "poll now" wakeup.
//!
//! Grounded on the teacher's `seesaw-outbox` crate, narrowed to this
//! workspace's one use: pollers are already correct and complete on their
//! own timer (`batchflow_core::poller::Poller`); this crate exists purely
//! to shave latency off the common case by waking a sleeping poller early.
//! Losing an entry, or never draining it, changes nothing but latency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Why an outbox entry was written. Mirrors the state transitions that make
/// more work eligible: a fresh submission, a retry becoming due, or an
/// operator re-drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxKind {
    JobSubmitted,
    UnitRetryScheduled,
    UnitRedriven,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub kind: OutboxKind,
    pub job_id: Option<Uuid>,
    pub input_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait OutboxWriter: Send + Sync {
    async fn write(&self, kind: OutboxKind, job_id: Option<Uuid>, input_id: Option<Uuid>);
}

#[async_trait]
pub trait OutboxReader: Send + Sync {
    async fn claim_unpublished(&self, limit: usize) -> Vec<OutboxEntry>;
    async fn mark_published(&self, ids: &[i64]);
    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> usize;
}

/// The process-local outbox. Not durable across restarts; it exists to
/// optimize latency, not to replace the database's own transactional
/// guarantees, so keeping it in memory (rather than wiring a real
/// `outbox_events` table through `batchflow-postgres`) loses nothing a
/// poller's own timer doesn't already cover.
#[derive(Default)]
pub struct InMemoryOutbox {
    rows: DashMap<i64, OutboxEntry>,
    next_id: AtomicI64,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxWriter for InMemoryOutbox {
    async fn write(&self, kind: OutboxKind, job_id: Option<Uuid>, input_id: Option<Uuid>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.rows.insert(
            id,
            OutboxEntry {
                id,
                kind,
                job_id,
                input_id,
                occurred_at: Utc::now(),
                published_at: None,
            },
        );
    }
}

#[async_trait]
impl OutboxReader for InMemoryOutbox {
    async fn claim_unpublished(&self, limit: usize) -> Vec<OutboxEntry> {
        let mut entries: Vec<OutboxEntry> = self
            .rows
            .iter()
            .filter(|r| r.published_at.is_none())
            .map(|r| r.value().clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit);
        entries
    }

    async fn mark_published(&self, ids: &[i64]) {
        let now = Utc::now();
        for id in ids {
            if let Some(mut entry) = self.rows.get_mut(id) {
                entry.published_at = Some(now);
            }
        }
    }

    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> usize {
        let to_remove: Vec<i64> = self
            .rows
            .iter()
            .filter(|r| r.published_at.map(|p| p < older_than).unwrap_or(false))
            .map(|r| *r.key())
            .collect();
        for id in &to_remove {
            self.rows.remove(id);
        }
        to_remove.len()
    }
}

/// The "poll now" signal itself: a `Notify` a poller can race against its
/// own sleep. Cloning shares the same underlying notification.
#[derive(Clone, Default)]
pub struct PollHint {
    notify: Arc<Notify>,
}

impl PollHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.notify.notify_waiters();
    }

    /// Resolves on the next signal, or never; callers race this against a
    /// timeout/sleep so a lost or coalesced signal is never fatal.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Drains an `OutboxReader` on an interval and raises `PollHint` for each
/// batch found, exactly the teacher's publisher loop generalized from
/// `EventBus` emission to a bare wakeup.
pub struct NotifyPublisher<R> {
    reader: Arc<R>,
    hint: PollHint,
    batch_size: usize,
}

impl<R: OutboxReader + 'static> NotifyPublisher<R> {
    pub fn new(reader: Arc<R>, hint: PollHint, batch_size: usize) -> Self {
        Self {
            reader,
            hint,
            batch_size,
        }
    }

    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> usize {
        let entries = self.reader.claim_unpublished(self.batch_size).await;
        if entries.is_empty() {
            return 0;
        }
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        self.reader.mark_published(&ids).await;
        self.hint.signal();
        debug!(count = ids.len(), "drained outbox, signaled poll hint");
        ids.len()
    }

    pub async fn run_periodic(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.drain_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_claim_then_publish() {
        let outbox = InMemoryOutbox::new();
        outbox
            .write(OutboxKind::JobSubmitted, Some(Uuid::new_v4()), None)
            .await;
        outbox
            .write(OutboxKind::UnitRetryScheduled, None, Some(Uuid::new_v4()))
            .await;

        let claimed = outbox.claim_unpublished(10).await;
        assert_eq!(claimed.len(), 2);

        let ids: Vec<i64> = claimed.iter().map(|e| e.id).collect();
        outbox.mark_published(&ids).await;

        assert!(outbox.claim_unpublished(10).await.is_empty());
    }

    #[tokio::test]
    async fn publisher_signals_poll_hint_on_drain() {
        let outbox = Arc::new(InMemoryOutbox::new());
        outbox.write(OutboxKind::JobSubmitted, None, None).await;

        let hint = PollHint::new();
        let publisher = NotifyPublisher::new(outbox, hint.clone(), 100);

        let waiter = tokio::spawn({
            let hint = hint.clone();
            async move {
                tokio::time::timeout(std::time::Duration::from_secs(1), hint.wait()).await
            }
        });

        let drained = publisher.drain_once().await;
        assert_eq!(drained, 1);
        assert!(waiter.await.unwrap().is_ok(), "poll hint never fired");
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_published_entries() {
        let outbox = InMemoryOutbox::new();
        outbox.write(OutboxKind::JobSubmitted, None, None).await;
        let claimed = outbox.claim_unpublished(10).await;
        outbox.mark_published(&[claimed[0].id]).await;

        let removed = outbox.cleanup_published(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(removed, 1);
    }
}
