//! Bottle protocol client.
//!
//! A [`Client`] drives one connection to a Bottle server. All operations
//! take `&self`, so any number of tasks can share a client (behind an `Arc`)
//! and pipeline their requests; the [`Sequencer`] writes the requests and
//! reads the replies in the order the operations were started.
//!
//! # Example
//!
//! ```ignore
//! use mailbottle::{BottleInfo, Client, ClientConfig};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:2626").await?;
//! let client = Client::new(stream, ClientConfig::default());
//!
//! let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");
//! let bid = client.send_bottle(&info, b"Subject: hi\r\n\r\nhello\r\n").await?;
//!
//! if let Some(polled) = client.poll().await? {
//!     let record = polled.body.read_to_end().await?;
//!     client.purge(&polled.id).await?;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::codec::{self, BottleInfo, DotReader, DotWriter};
use crate::framed::{self, DEFAULT_MAX_LINE_LENGTH};
use crate::handler::BottleId;
use crate::reply::{Reply, ReplyCode};
use crate::sequencer::{Sequencer, Turn};
use crate::{Error, Result};

/// Bottle client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum number of operations in flight on the connection.
    pub max_in_flight: usize,
    /// Deadline for writing one request or reading one reply.
    pub io_timeout: Duration,
    /// Maximum reply line length.
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            io_timeout: Duration::from_secs(120),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ClientConfig {
    /// Sets the in-flight operation limit (at least one).
    #[must_use]
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Sets the I/O timeout.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the maximum reply line length.
    #[must_use]
    pub const fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }
}

type Reader<S> = BufReader<ReadHalf<S>>;

/// A request as it goes on the wire.
enum Request<'a> {
    Message(&'a mut (dyn AsyncRead + Send + Unpin)),
    Poll,
    Purge(&'a str),
}

/// Reply plus the read access still held after it.
struct Response<S> {
    reply: Reply,
    turn: Turn,
    reader: OwnedMutexGuard<Reader<S>>,
    permit: OwnedSemaphorePermit,
}

/// Closes the sequencer if an operation is abandoned half way.
///
/// An operation that took a sequence number but never went through both of
/// its turns would stall every later operation forever.
struct Abandon<'a> {
    sequencer: &'a Sequencer,
    armed: bool,
}

impl Drop for Abandon<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("bottle operation abandoned, closing connection");
            self.sequencer.close();
        }
    }
}

/// Client side of a Bottle connection.
#[derive(Debug)]
pub struct Client<S> {
    sequencer: Arc<Sequencer>,
    reader: Arc<Mutex<Reader<S>>>,
    writer: Mutex<BufWriter<WriteHalf<S>>>,
    permits: Arc<Semaphore>,
    config: ClientConfig,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps an established connection.
    pub fn new(stream: S, config: ClientConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            sequencer: Arc::new(Sequencer::new()),
            reader: Arc::new(Mutex::new(BufReader::new(read_half))),
            writer: Mutex::new(BufWriter::new(write_half)),
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
        }
    }

    /// Submits a bottle record and returns the identifier the server gave it.
    ///
    /// `record` must yield a complete record: header, `DATA` marker and a
    /// dot-terminated body (see [`codec::write_info`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the server refuses the bottle (use
    /// [`Error::is_try_again`] to detect a busy server), or a transport error.
    pub async fn message(&self, record: &mut (dyn AsyncRead + Send + Unpin)) -> Result<BottleId> {
        let response = self.call(Request::Message(record)).await?;
        let reply = finish(response);
        if reply.code == ReplyCode::COMPLETED {
            Ok(reply.message_text())
        } else {
            Err(reply.into_error())
        }
    }

    /// Encodes `info` and `body` into a record and submits it.
    ///
    /// # Errors
    ///
    /// Same as [`message`](Self::message), plus an error if an address
    /// cannot be encoded.
    pub async fn send_bottle(&self, info: &BottleInfo, body: &[u8]) -> Result<BottleId> {
        let record = codec::encode(info, body).await?;
        self.message(&mut record.as_slice()).await
    }

    /// Asks the server for the next queued bottle.
    ///
    /// Returns `Ok(None)` if the queue is empty. A returned body must be
    /// consumed with [`PollBody::copy_to`] or [`PollBody::read_to_end`]; see
    /// [`PollBody`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] for a backend failure, or a transport error.
    pub async fn poll(&self) -> Result<Option<PolledBottle<S>>> {
        let response = self.call(Request::Poll).await?;

        if response.reply.code == ReplyCode::BOTTLE_FOLLOWS {
            let text = response.reply.message_text();
            let Some(id) = text.strip_prefix("ID ") else {
                drop(response);
                self.sequencer.close();
                return Err(Error::Protocol(format!("malformed POLL reply: {text}")));
            };
            return Ok(Some(PolledBottle {
                id: id.to_string(),
                body: PollBody {
                    sequencer: Arc::clone(&self.sequencer),
                    reader: response.reader,
                    turn: response.turn,
                    _permit: response.permit,
                    timeout: self.config.io_timeout,
                    consumed: false,
                },
            }));
        }

        let reply = finish(response);
        if reply.code == ReplyCode::POLL_EMPTY {
            Ok(None)
        } else {
            Err(reply.into_error())
        }
    }

    /// Removes a bottle from the server's queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the server could not purge it, or
    /// [`Error::Protocol`] if `bid` is not a single token.
    pub async fn purge(&self, bid: &str) -> Result<()> {
        if bid.is_empty() || bid.contains(char::is_whitespace) {
            return Err(Error::Protocol(format!("invalid bottle id: {bid:?}")));
        }

        let reply = finish(self.call(Request::Purge(bid)).await?);
        if reply.code == ReplyCode::COMPLETED {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }

    /// Stops the connection: later operations fail with [`Error::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if shutting down the write side fails.
    pub async fn close(&self) -> Result<()> {
        self.sequencer.close();
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    /// Returns true once the connection has been closed or has failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sequencer.is_closed()
    }

    async fn call(&self, request: Request<'_>) -> Result<Response<S>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let id = self.sequencer.next();
        let mut abandon = Abandon {
            sequencer: &self.sequencer,
            armed: true,
        };

        let turn = self.sequencer.start_request(id).await?;
        {
            let mut writer = self.writer.lock().await;
            let written = framed::with_timeout(
                self.config.io_timeout,
                write_request(&mut *writer, request),
            )
            .await;
            if let Err(e) = written {
                self.sequencer.close();
                return Err(e);
            }
        }
        turn.end();

        let turn = self.sequencer.start_response(id).await?;
        let mut reader = Arc::clone(&self.reader).lock_owned().await;
        let reply = tokio::time::timeout(
            self.config.io_timeout,
            framed::read_reply(&mut *reader, self.config.max_line_length),
        )
        .await
        .unwrap_or(Err(Error::Timeout(self.config.io_timeout)));
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.sequencer.close();
                return Err(e);
            }
        };

        abandon.armed = false;
        debug!(id, code = reply.code.as_u16(), "bottle reply");
        Ok(Response {
            reply,
            turn,
            reader,
            permit,
        })
    }
}

/// Releases the turns of a reply that carries no payload.
fn finish<S>(response: Response<S>) -> Reply {
    let Response {
        reply,
        turn,
        reader,
        permit,
    } = response;
    drop(reader);
    turn.end();
    drop(permit);
    reply
}

async fn write_request<W>(writer: &mut W, request: Request<'_>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match request {
        Request::Message(record) => {
            writer.write_all(b"MESSAGE\r\n").await?;
            let mut dot = DotWriter::new(&mut *writer);
            tokio::io::copy(record, &mut dot).await?;
            dot.finish().await?;
        }
        Request::Poll => writer.write_all(b"POLL\r\n").await?,
        Request::Purge(bid) => writer.write_all(format!("PURGE {bid}\r\n").as_bytes()).await?,
    }
    writer.flush().await
}

/// A bottle handed out by POLL.
#[derive(Debug)]
pub struct PolledBottle<S> {
    /// Identifier to PURGE once the bottle has been delivered.
    pub id: BottleId,
    /// The bottle record, still on the wire.
    pub body: PollBody<S>,
}

/// The record of a polled bottle, streamed straight off the connection.
///
/// The body holds the connection's reply stream: no other reply can be read
/// until it has been consumed. Stream it to completion with
/// [`copy_to`](Self::copy_to) or [`read_to_end`](Self::read_to_end).
///
/// Dropping a `PollBody` unread closes the connection, and every later
/// operation on the client fails with [`Error::Closed`].
#[derive(Debug)]
pub struct PollBody<S> {
    sequencer: Arc<Sequencer>,
    reader: OwnedMutexGuard<Reader<S>>,
    turn: Turn,
    _permit: OwnedSemaphorePermit,
    timeout: Duration,
    consumed: bool,
}

impl<S> PollBody<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Streams the record into `dst` and releases the connection.
    ///
    /// # Errors
    ///
    /// Any failure, on the connection or on `dst`, closes the connection.
    pub async fn copy_to<W>(mut self, dst: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut body = DotReader::new(&mut *self.reader);
        let copied = framed::with_timeout(self.timeout, tokio::io::copy(&mut body, dst)).await;
        if copied.is_ok() {
            self.consumed = true;
        }
        copied
    }

    /// Reads the whole record into memory.
    ///
    /// # Errors
    ///
    /// See [`copy_to`](Self::copy_to).
    pub async fn read_to_end(self) -> Result<Vec<u8>> {
        let mut record = Vec::new();
        self.copy_to(&mut record).await?;
        Ok(record)
    }
}

impl<S> Drop for PollBody<S> {
    fn drop(&mut self) {
        if !self.consumed {
            warn!(id = self.turn.id(), "poll body dropped unread, closing connection");
            self.sequencer.close();
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
    use super::*;

    fn client(script: tokio_test::io::Mock) -> Client<tokio_test::io::Mock> {
        Client::new(script, ClientConfig::default())
    }

    #[tokio::test]
    async fn test_send_bottle() {
        let script = tokio_test::io::Builder::new()
            .write(b"MESSAGE\r\nFROM:a@x\r\nRCPT-TO:b@y\r\nDATA\r\n...\r\n..\r\n.\r\n")
            .read(b"201 20261019-1\r\n")
            .build();
        let client = client(script);
        let info = BottleInfo::new().with_from("a@x").with_rcpt_to("b@y");
        let bid = client.send_bottle(&info, b".\r\n").await.unwrap();
        assert_eq!(bid, "20261019-1");
    }

    #[tokio::test]
    async fn test_message_try_again() {
        let script = tokio_test::io::Builder::new()
            .write(b"MESSAGE\r\nDATA\r\n..\r\n.\r\n")
            .read(b"301 Try-Again-Later\r\n")
            .build();
        let client = client(script);
        let err = client
            .message(&mut &b"DATA\r\n.\r\n"[..])
            .await
            .unwrap_err();
        assert!(err.is_try_again());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_poll_empty() {
        let script = tokio_test::io::Builder::new()
            .write(b"POLL\r\n")
            .read(b"401 Poll-Empty\r\n")
            .build();
        assert!(client(script).poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_body() {
        let script = tokio_test::io::Builder::new()
            .write(b"POLL\r\n")
            .read(b"200 ID b7\r\nDATA\r\n..x\r\n.\r\n")
            .write(b"PURGE b7\r\n")
            .read(b"201 Purged b7\r\n")
            .build();
        let client = client(script);
        let polled = client.poll().await.unwrap().unwrap();
        assert_eq!(polled.id, "b7");
        assert_eq!(polled.body.read_to_end().await.unwrap(), b"DATA\r\n.x\r\n");
        client.purge("b7").await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_poll_body_closes() {
        let script = tokio_test::io::Builder::new()
            .write(b"POLL\r\n")
            .read(b"200 ID b7\r\n")
            .build();
        let client = client(script);
        let polled = client.poll().await.unwrap().unwrap();
        drop(polled);
        assert!(client.is_closed());
        assert!(matches!(client.purge("b7").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_purge_failure() {
        let script = tokio_test::io::Builder::new()
            .write(b"PURGE zz\r\n")
            .read(b"501 bottle not found: zz\r\n")
            .build();
        let err = client(script).purge("zz").await.unwrap_err();
        assert!(matches!(err, Error::Remote { code: 501, .. }));
    }

    #[tokio::test]
    async fn test_purge_rejects_bad_id() {
        let client = client(tokio_test::io::Builder::new().build());
        assert!(matches!(
            client.purge("a b").await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let script = tokio_test::io::Builder::new().write(b"POLL\r\n").build();
        let client = client(script);
        assert!(matches!(client.poll().await, Err(Error::Closed)));
        assert!(client.is_closed());
    }
}
