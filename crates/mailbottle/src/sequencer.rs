//! Ordered turn-taking for pipelined connections.
//!
//! A Bottle connection carries many requests at once, but it is still a single
//! duplex byte stream. The [`Sequencer`] hands every incoming command a
//! sequence number and then serializes *physical* access to the stream:
//!
//! - requests are read off the wire strictly in ascending order, one reader at
//!   a time ([`Sequencer::start_request`]);
//! - responses are written strictly in ascending order, one writer at a time
//!   ([`Sequencer::start_response`]).
//!
//! Everything a request does between releasing its read turn and acquiring
//! its write turn runs concurrently with every other request. A slow request
//! therefore delays the responses of faster requests issued after it
//! (head-of-line blocking on output), but never their processing.
//!
//! Turns are guards: dropping a [`Turn`] releases it, so a handler that bails
//! out with `?` cannot wedge the connection. [`Sequencer::close`] wakes every
//! waiter with [`Error::Closed`] once the stream is known to be dead.
//!
//! # Example
//!
//! ```ignore
//! let sequencer = Arc::new(Sequencer::new());
//!
//! let id = sequencer.next();
//! let read = sequencer.start_request(id).await?;
//! // ... read the command and its payload ...
//! read.end();
//!
//! // ... concurrent work ...
//!
//! let write = sequencer.start_response(id).await?;
//! // ... write the reply ...
//! write.end();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::{Error, Result};

/// Position of one direction of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    /// Sequence number currently allowed to use the stream.
    current: u64,
    /// Set once the connection is dead.
    closed: bool,
}

/// Hands out turns for one direction of the stream in ascending order.
#[derive(Debug)]
struct Turnstile {
    position: watch::Sender<Position>,
}

impl Turnstile {
    fn new() -> Self {
        let (position, _) = watch::channel(Position {
            current: 0,
            closed: false,
        });
        Self { position }
    }

    async fn wait(&self, id: u64) -> Result<()> {
        let mut rx = self.position.subscribe();
        let position = *rx
            .wait_for(|p| p.closed || p.current == id)
            .await
            .map_err(|_| Error::Closed)?;

        if position.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn release(&self, id: u64) {
        self.position.send_modify(|p| {
            if p.current == id {
                p.current += 1;
            } else {
                tracing::warn!(id, current = p.current, "released a turn that was not held");
            }
        });
    }

    fn close(&self) {
        self.position.send_modify(|p| p.closed = true);
    }

    fn is_closed(&self) -> bool {
        self.position.borrow().closed
    }
}

/// Which direction of the stream a [`Turn`] grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Permission to read a request off the stream.
    Request,
    /// Permission to write a response to the stream.
    Response,
}

/// Per-connection request/response sequencer.
#[derive(Debug)]
pub struct Sequencer {
    next: AtomicU64,
    requests: Turnstile,
    responses: Turnstile,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Creates a sequencer for a fresh connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            requests: Turnstile::new(),
            responses: Turnstile::new(),
        }
    }

    /// Returns the next sequence number, starting at zero.
    ///
    /// Call exactly once per command. Every number handed out must later be
    /// taken through both [`start_request`](Self::start_request) and
    /// [`start_response`](Self::start_response) (or the sequencer closed),
    /// otherwise the requests after it never get their turn.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Waits until request `id` may read from the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the sequencer is closed before the turn
    /// arrives.
    pub async fn start_request(self: &Arc<Self>, id: u64) -> Result<Turn> {
        self.requests.wait(id).await?;
        Ok(Turn {
            sequencer: Arc::clone(self),
            id,
            side: Side::Request,
        })
    }

    /// Waits until request `id` may write its response to the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the sequencer is closed before the turn
    /// arrives.
    pub async fn start_response(self: &Arc<Self>, id: u64) -> Result<Turn> {
        self.responses.wait(id).await?;
        Ok(Turn {
            sequencer: Arc::clone(self),
            id,
            side: Side::Response,
        })
    }

    /// Marks the connection dead and wakes every waiting turn with
    /// [`Error::Closed`]. Turns already held are unaffected.
    pub fn close(&self) {
        self.requests.close();
        self.responses.close();
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// Exclusive access to one direction of the stream for one request.
///
/// The turn is released when this value is dropped; [`Turn::end`] just makes
/// the release point explicit.
#[must_use = "dropping a turn releases it immediately"]
#[derive(Debug)]
pub struct Turn {
    sequencer: Arc<Sequencer>,
    id: u64,
    side: Side,
}

impl Turn {
    /// Sequence number this turn belongs to.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Direction this turn grants.
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    /// Releases the turn, letting the next sequence number proceed.
    pub fn end(self) {}
}

impl Drop for Turn {
    fn drop(&mut self) {
        match self.side {
            Side::Request => self.sequencer.requests.release(self.id),
            Side::Response => self.sequencer.responses.release(self.id),
        }
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

    use tokio::sync::Mutex;

    use super::*;

    #[test]
    fn test_next_is_monotonic_from_zero() {
        let sequencer = Sequencer::new();
        assert_eq!(sequencer.next(), 0);
        assert_eq!(sequencer.next(), 1);
        assert_eq!(sequencer.next(), 2);
    }

    #[test]
    fn test_next_never_repeats() {
        let sequencer = Sequencer::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10000 {
            assert!(seen.insert(sequencer.next()), "duplicate sequence number");
        }
    }

    #[tokio::test]
    async fn test_first_turn_is_immediate() {
        let sequencer = Arc::new(Sequencer::new());
        let id = sequencer.next();
        let turn = sequencer.start_request(id).await.unwrap();
        assert_eq!(turn.id(), 0);
        assert_eq!(turn.side(), Side::Request);
    }

    #[tokio::test]
    async fn test_request_turns_in_ascending_order() {
        let sequencer = Arc::new(Sequencer::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<u64> = (0..5).map(|_| sequencer.next()).collect();

        // Spawn waiters in reverse so scheduling order cannot explain the result.
        let mut handles = Vec::new();
        for &id in ids.iter().rev() {
            let sequencer = Arc::clone(&sequencer);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let turn = sequencer.start_request(id).await.unwrap();
                order.lock().await.push(id);
                turn.end();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_follow_request_order_despite_latency() {
        let sequencer = Arc::new(Sequencer::new());
        let output = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for slot in 0..6u64 {
            let id = sequencer.next();
            let read = sequencer.start_request(id).await.unwrap();
            read.end();

            let sequencer = Arc::clone(&sequencer);
            let output = Arc::clone(&output);
            handles.push(tokio::spawn(async move {
                // Earlier requests take longer to finish their work.
                tokio::time::sleep(Duration::from_millis(60 - slot * 10)).await;
                let write = sequencer.start_response(id).await.unwrap();
                output.lock().await.push(id);
                write.end();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*output.lock().await, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_dropped_turn_releases() {
        async fn failing(sequencer: Arc<Sequencer>, id: u64) -> Result<()> {
            let _turn = sequencer.start_request(id).await?;
            Err(Error::Protocol("boom".into()))
        }

        let sequencer = Arc::new(Sequencer::new());
        let first = sequencer.next();
        let second = sequencer.next();

        assert!(failing(Arc::clone(&sequencer), first).await.is_err());
        let turn = tokio::time::timeout(
            Duration::from_secs(1),
            sequencer.start_request(second),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(turn.id(), second);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let sequencer = Arc::new(Sequencer::new());
        let first = sequencer.next();
        let second = sequencer.next();

        let held = sequencer.start_response(first).await.unwrap();
        let waiter = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move { sequencer.start_response(second).await })
        };

        tokio::task::yield_now().await;
        sequencer.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Closed)));
        assert!(sequencer.is_closed());
        drop(held);
    }

    #[tokio::test]
    async fn test_closed_sequencer_refuses_new_turns() {
        let sequencer = Arc::new(Sequencer::new());
        sequencer.close();
        let id = sequencer.next();
        assert!(matches!(
            sequencer.start_request(id).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_directions_are_independent() {
        let sequencer = Arc::new(Sequencer::new());
        let first = sequencer.next();
        let second = sequencer.next();

        let read = sequencer.start_request(first).await.unwrap();
        read.end();
        let read = sequencer.start_request(second).await.unwrap();

        // Request 1 is still reading, but request 0 may already respond.
        let write = sequencer.start_response(first).await.unwrap();
        write.end();
        read.end();
    }
}
