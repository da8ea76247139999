//! The in-memory queue: intake, leased polling and purge.
//!
//! Bottles are kept in arrival order. A POLL hands out the oldest bottle that
//! is not leased and hides it for the configured lease; a PURGE removes it for
//! good. Nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use mailbottle::codec::{self, BottleInfo};
use mailbottle::{BodyProducer, BottleId, Handler, HandlerError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::QueueConfig;

/// A bottle held by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBottle {
    /// Identifier handed out on intake.
    pub id: BottleId,
    /// Envelope parsed from the record.
    pub info: BottleInfo,
    /// The record exactly as received.
    pub record: Bytes,
}

#[derive(Debug)]
struct Entry {
    bottle: QueuedBottle,
    leased_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    /// Bottles by arrival order.
    entries: BTreeMap<u64, Entry>,
    index: HashMap<BottleId, u64>,
}

/// In-memory bottle queue
///
/// Bottles are kept in arrival order. POLL hands out the oldest bottle that
/// is not currently leased and leases it, so that concurrent pollers do not
/// get the same bottle. A lease that runs out without a PURGE makes the
/// bottle available again.
///
/// Nothing is persisted: the queue is for tests, development and transient
/// hand-off.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    sequence: Arc<AtomicU64>,
    config: QueueConfig,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            sequence: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Number of queued bottles, leased or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every queued bottle, oldest first
    #[must_use]
    pub fn bottles(&self) -> Vec<QueuedBottle> {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.bottle.clone())
            .collect()
    }

    /// Look up one bottle
    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueuedBottle> {
        let state = self.lock();
        let seq = state.index.get(id)?;
        state.entries.get(seq).map(|entry| entry.bottle.clone())
    }

    /// Recovers the state if a panic poisoned the lock; every update is a
    /// single insert or remove.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_full(&self) -> bool {
        self.config.capacity.is_some_and(|cap| self.len() >= cap)
    }
}

/// Bottle ids are the intake time plus the arrival sequence number.
fn mint_id(seq: u64) -> BottleId {
    format!("{}-{seq:06}", chrono::Utc::now().format("%Y%m%d%H%M%S"))
}

/// Checks that a record parses and names a sender and a recipient.
async fn validate(record: &[u8]) -> Result<BottleInfo, HandlerError> {
    let mut info = BottleInfo::new();
    let mut body = codec::read_info(record, &mut info)
        .await
        .map_err(|e| HandlerError::Invalid(e.to_string()))?;
    body.drain()
        .await
        .map_err(|e| HandlerError::Invalid(e.to_string()))?;

    if info.from.is_empty() {
        return Err(HandlerError::Invalid("bottle has no sender".into()));
    }
    if info.rcpt_to.is_empty() {
        return Err(HandlerError::Invalid("bottle has no recipient".into()));
    }
    Ok(info)
}

#[async_trait]
impl Handler for MemoryQueue {
    async fn handle_bottle(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError> {
        if self.is_full() {
            return Err(HandlerError::TryAgain);
        }

        let limit = self.config.max_record_size;
        let mut record = Vec::new();
        (&mut *src)
            .take(limit as u64 + 1)
            .read_to_end(&mut record)
            .await?;
        if record.len() > limit {
            return Err(HandlerError::Invalid(format!(
                "bottle exceeds {limit} bytes"
            )));
        }

        let info = validate(&record).await?;

        let mut state = self.lock();
        if self
            .config
            .capacity
            .is_some_and(|cap| state.entries.len() >= cap)
        {
            return Err(HandlerError::TryAgain);
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = mint_id(seq);
        state.index.insert(id.clone(), seq);
        state.entries.insert(
            seq,
            Entry {
                bottle: QueuedBottle {
                    id: id.clone(),
                    info,
                    record: Bytes::from(record),
                },
                leased_until: None,
            },
        );
        drop(state);

        info!(bid = %id, "queued bottle");
        Ok(id)
    }

    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
        let now = Instant::now();
        let lease = self.config.lease_duration();
        let mut state = self.lock();

        let entry = state
            .entries
            .values_mut()
            .find(|entry| entry.leased_until.is_none_or(|until| until <= now))
            .ok_or(HandlerError::PollEmpty)?;
        entry.leased_until = Some(now + lease);

        let id = entry.bottle.id.clone();
        let record = entry.bottle.record.clone();
        drop(state);

        debug!(bid = %id, ?lease, "leased bottle");
        Ok((id, Box::new(record)))
    }

    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError> {
        let mut state = self.lock();
        let seq = state
            .index
            .remove(id)
            .ok_or_else(|| HandlerError::NotFound(id.to_string()))?;
        state.entries.remove(&seq);
        drop(state);

        info!(bid = %id, "purged bottle");
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn record(from: &str, to: &str, body: &[u8]) -> Vec<u8> {
        let info = BottleInfo::new().with_from(from).with_rcpt_to(to);
        codec::encode(&info, body).await.unwrap()
    }

    async fn submit(queue: &MemoryQueue, record: &[u8]) -> Result<BottleId, HandlerError> {
        let mut src = record;
        queue.handle_bottle(&mut src).await
    }

    async fn produce(producer: Box<dyn BodyProducer>) -> Vec<u8> {
        let mut out = Vec::new();
        producer.produce(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_intake_and_poll() {
        let queue = MemoryQueue::default();
        let rec = record("a@x", "b@y", b"hello\r\n").await;
        let id = submit(&queue, &rec).await.unwrap();

        assert_eq!(queue.len(), 1);
        let stored = queue.get(&id).unwrap();
        assert_eq!(stored.info.from, vec!["a@x"]);
        assert_eq!(stored.info.rcpt_to, vec!["b@y"]);

        let (polled, producer) = queue.poll_bottle().await.unwrap();
        assert_eq!(polled, id);
        assert_eq!(produce(producer).await, rec);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let queue = MemoryQueue::default();
        let rec = record("a@x", "b@y", b"x\r\n").await;
        let first = submit(&queue, &rec).await.unwrap();
        let second = submit(&queue, &rec).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_rejects_missing_recipient() {
        let queue = MemoryQueue::default();
        let info = BottleInfo::new().with_from("a@x");
        let rec = codec::encode(&info, b"x\r\n").await.unwrap();
        assert!(matches!(
            submit(&queue, &rec).await,
            Err(HandlerError::Invalid(_))
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_malformed_record() {
        let queue = MemoryQueue::default();
        assert!(matches!(
            submit(&queue, b"FROM:a@x\r\nRCPT-TO:b@y\r\n").await,
            Err(HandlerError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_utf8_sender() {
        let queue = MemoryQueue::default();
        assert!(matches!(
            submit(&queue, b"FROM:\xc3(@x\r\nRCPT-TO:b@y\r\nDATA\r\n.\r\n").await,
            Err(HandlerError::Invalid(_))
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_oversized_record() {
        let queue = MemoryQueue::new(QueueConfig::default().max_record_size(16));
        let rec = record("a@x", "b@y", b"this body is far too long\r\n").await;
        assert!(matches!(
            submit(&queue, &rec).await,
            Err(HandlerError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_asks_to_try_again() {
        let queue = MemoryQueue::new(QueueConfig::default().capacity(1));
        let rec = record("a@x", "b@y", b"x\r\n").await;
        submit(&queue, &rec).await.unwrap();
        assert!(matches!(
            submit(&queue, &rec).await,
            Err(HandlerError::TryAgain)
        ));
    }

    #[tokio::test]
    async fn test_poll_empty() {
        let queue = MemoryQueue::default();
        assert!(matches!(
            queue.poll_bottle().await,
            Err(HandlerError::PollEmpty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_hides_then_expires() {
        let queue = MemoryQueue::new(QueueConfig::default().lease(Duration::from_secs(60)));
        let rec = record("a@x", "b@y", b"x\r\n").await;
        let id = submit(&queue, &rec).await.unwrap();

        let (first, _) = queue.poll_bottle().await.unwrap();
        assert_eq!(first, id);
        assert!(matches!(
            queue.poll_bottle().await,
            Err(HandlerError::PollEmpty)
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        let (again, _) = queue.poll_bottle().await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_poll_oldest_first() {
        let queue = MemoryQueue::default();
        let first = submit(&queue, &record("a@x", "b@y", b"1\r\n").await)
            .await
            .unwrap();
        let second = submit(&queue, &record("a@x", "b@y", b"2\r\n").await)
            .await
            .unwrap();

        assert_eq!(queue.poll_bottle().await.unwrap().0, first);
        assert_eq!(queue.poll_bottle().await.unwrap().0, second);
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = MemoryQueue::default();
        let id = submit(&queue, &record("a@x", "b@y", b"x\r\n").await)
            .await
            .unwrap();

        assert!(matches!(
            queue.purge_bottle("missing").await,
            Err(HandlerError::NotFound(_))
        ));
        queue.purge_bottle(&id).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.get(&id).is_none());
    }
}
