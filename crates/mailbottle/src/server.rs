//! Bottle protocol server.
//!
//! The server reads `MESSAGE`, `POLL` and `PURGE <id>` commands off one
//! connection and answers them through a [`Handler`]. Every command runs in
//! its own task; the [`Sequencer`] keeps the commands' reads and the replies
//! in arrival order, so a client may pipeline as many requests as the
//! in-flight limit allows.

use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{DotReader, DotWriter};
use crate::framed::{self, DEFAULT_MAX_LINE_LENGTH};
use crate::handler::{Handler, HandlerError};
use crate::reply::{Reply, ReplyCode};
use crate::sequencer::{Sequencer, Turn};
use crate::{Error, Result};

/// Bottle server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of commands being handled at once.
    pub max_in_flight: usize,
    /// How long to wait for the next command, and for a MESSAGE payload.
    pub read_timeout: Duration,
    /// How long writing one reply (including a POLL body) may take.
    pub write_timeout: Duration,
    /// How long a backend call may take.
    pub request_timeout: Duration,
    /// Maximum command line length.
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(120),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the in-flight command limit (at least one).
    #[must_use]
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Sets the read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the backend request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum command line length.
    #[must_use]
    pub const fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Message,
    Poll,
    Purge(String),
    Unknown,
}

impl Command {
    fn parse(line: &str) -> Self {
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "MESSAGE" => Self::Message,
            "POLL" => Self::Poll,
            "PURGE" if !rest.trim().is_empty() => Self::Purge(rest.trim().to_string()),
            _ => Self::Unknown,
        }
    }

    const fn verb(&self) -> &'static str {
        match self {
            Self::Message => "MESSAGE",
            Self::Poll => "POLL",
            Self::Purge(_) => "PURGE",
            Self::Unknown => "unknown",
        }
    }
}

/// Serves the Bottle protocol for a [`Handler`].
#[derive(Clone)]
pub struct Server {
    handler: Arc<dyn Handler>,
    config: ServerConfig,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server for `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>, config: ServerConfig) -> Self {
        Self { handler, config }
    }

    /// Serves one connection until the peer closes it or it fails.
    ///
    /// Commands already accepted when the peer stops sending still get their
    /// replies before the stream is shut down.
    ///
    /// # Errors
    ///
    /// Returns the first transport error that ended the connection.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Arc::new(Connection {
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            sequencer: Arc::new(Sequencer::new()),
            reader: Arc::new(Mutex::new(BufReader::new(read_half))),
            writer: Arc::new(Mutex::new(BufWriter::new(write_half))),
        });
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut tasks = JoinSet::new();
        let mut outcome = Ok(());

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let id = conn.sequencer.next();
            let Ok(read_turn) = conn.sequencer.start_request(id).await else {
                break;
            };
            let mut reader = Arc::clone(&conn.reader).lock_owned().await;

            let line = tokio::time::timeout(
                conn.config.read_timeout,
                framed::read_line(&mut *reader, conn.config.max_line_length),
            )
            .await;

            let line = match line {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    debug!("peer closed the connection");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to read command");
                    drop(reader);
                    read_turn.end();
                    let reply = Reply::single(ReplyCode::INTERNAL_ERROR, "Internal Server error");
                    // The connection ends either way.
                    let _ = conn.respond(id, &reply).await;
                    outcome = Err(Error::Io(e));
                    break;
                }
                Err(_) => {
                    debug!(timeout = ?conn.config.read_timeout, "idle connection timed out");
                    break;
                }
            };

            let command = Command::parse(&line);
            debug!(id, command = command.verb(), "accepted command");
            tasks.spawn(Arc::clone(&conn).handle(id, command, read_turn, reader, permit));

            while let Some(joined) = tasks.try_join_next() {
                record(&conn.sequencer, &mut outcome, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(&conn.sequencer, &mut outcome, joined);
        }

        let mut writer = conn.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "shutdown failed");
        }

        outcome
    }
}

fn record(
    sequencer: &Sequencer,
    outcome: &mut Result<()>,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => {
            // Its turns may never have been taken; nothing after it can run.
            warn!(error = %e, "command task failed");
            sequencer.close();
            Error::Closed
        }
    };
    debug!(error = %err, "command ended the connection");
    if outcome.is_ok() {
        *outcome = Err(err);
    }
}

type Reader<S> = BufReader<ReadHalf<S>>;

struct Connection<S> {
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    sequencer: Arc<Sequencer>,
    reader: Arc<Mutex<Reader<S>>>,
    writer: Arc<Mutex<BufWriter<WriteHalf<S>>>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn handle(
        self: Arc<Self>,
        id: u64,
        command: Command,
        read_turn: Turn,
        reader: OwnedMutexGuard<Reader<S>>,
        _permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        match command {
            Command::Message => self.message(id, read_turn, reader).await,
            Command::Poll => {
                drop(reader);
                read_turn.end();
                self.poll(id).await
            }
            Command::Purge(bid) => {
                drop(reader);
                read_turn.end();
                self.purge(id, &bid).await
            }
            Command::Unknown => {
                drop(reader);
                read_turn.end();
                let reply = Reply::single(ReplyCode::UNKNOWN_COMMAND, "Error, unknown command");
                self.respond(id, &reply).await
            }
        }
    }

    async fn message(
        &self,
        id: u64,
        read_turn: Turn,
        reader: OwnedMutexGuard<Reader<S>>,
    ) -> Result<()> {
        let mut body = MessageBody {
            inner: Some(DotReader::new(Guarded(reader))),
            turn: Some(read_turn),
        };
        let outcome =
            call_backend(self.config.request_timeout, self.handler.handle_bottle(&mut body)).await;

        if let Some(mut rest) = body.inner.take() {
            let drained = framed::with_timeout(self.config.read_timeout, rest.drain()).await;
            if let Err(e) = drained {
                // Close before the read turn is released.
                let e = self.fail(e);
                drop(body);
                return Err(e);
            }
        }
        drop(body);

        let reply = match outcome {
            Ok(bid) => Reply::single(ReplyCode::COMPLETED, bid),
            Err(e) => failure_reply(&e),
        };
        self.respond(id, &reply).await
    }

    async fn poll(&self, id: u64) -> Result<()> {
        // A polled body may hold a turn of its own (a remote backend's
        // connection), so the backend is only asked once this reply is next.
        let turn = self.sequencer.start_response(id).await?;
        let (bid, producer) =
            match call_backend(self.config.request_timeout, self.handler.poll_bottle()).await {
                Ok(polled) => polled,
                Err(e) => return self.write_reply(turn, &failure_reply(&e)).await,
            };

        let mut writer = self.writer.lock().await;
        let written = framed::with_timeout(self.config.write_timeout, async {
            let status = Reply::single(ReplyCode::BOTTLE_FOLLOWS, format!("ID {bid}"));
            writer.write_all(status.to_wire().as_bytes()).await?;
            let mut dot = DotWriter::new(&mut *writer);
            AssertUnwindSafe(producer.produce(&mut dot))
                .catch_unwind()
                .await
                .map_err(|_| io::Error::other("bottle body producer panicked"))??;
            let writer = dot.finish().await?;
            writer.flush().await
        })
        .await;
        drop(writer);

        // Close before the turn goes, so no reply follows a partial body.
        let written = written.map_err(|e| self.fail(e));
        turn.end();
        written
    }

    async fn purge(&self, id: u64, bid: &str) -> Result<()> {
        let outcome =
            call_backend(self.config.request_timeout, self.handler.purge_bottle(bid)).await;

        let reply = match outcome {
            Ok(()) => Reply::single(ReplyCode::COMPLETED, format!("Purged {bid}")),
            Err(e) => Reply::single(ReplyCode::FAILED, single_line(&e.to_string())),
        };
        self.respond(id, &reply).await
    }

    /// Writes a reply once it is request `id`'s turn to respond.
    async fn respond(&self, id: u64, reply: &Reply) -> Result<()> {
        let turn = self.sequencer.start_response(id).await?;
        self.write_reply(turn, reply).await
    }

    /// Writes a reply under a response turn already held.
    async fn write_reply(&self, turn: Turn, reply: &Reply) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let written = framed::with_timeout(self.config.write_timeout, async {
            writer.write_all(reply.to_wire().as_bytes()).await?;
            writer.flush().await
        })
        .await;
        drop(writer);

        let written = written.map_err(|e| self.fail(e));
        turn.end();
        written
    }

    /// Marks the connection dead after a transport failure.
    fn fail(&self, err: Error) -> Error {
        warn!(error = %err, "bottle connection failed");
        self.sequencer.close();
        err
    }
}

/// Read access to the connection as an owned buffered reader.
struct Guarded<S>(OwnedMutexGuard<Reader<S>>);

impl<S: AsyncRead> AsyncRead for Guarded<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_read(cx, buf)
    }
}

impl<S: AsyncRead> AsyncBufRead for Guarded<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut *self.get_mut().0).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut *self.get_mut().0).consume(amt);
    }
}

/// MESSAGE payload handed to the backend.
///
/// Gives up the connection's read side as soon as the block terminator has
/// been read, so the next command can be read while the backend is still
/// working on this one.
struct MessageBody<S> {
    inner: Option<DotReader<Guarded<S>>>,
    turn: Option<Turn>,
}

impl<S: AsyncRead> AsyncRead for MessageBody<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        ready!(Pin::new(&mut *inner).poll_read(cx, buf))?;
        if inner.is_done() {
            this.inner = None;
            this.turn = None;
        }
        Poll::Ready(Ok(()))
    }
}

/// Runs one backend call under the request timeout.
///
/// A panicking backend fails only its own command.
async fn call_backend<T, F>(limit: Duration, call: F) -> std::result::Result<T, HandlerError>
where
    F: Future<Output = std::result::Result<T, HandlerError>>,
{
    match tokio::time::timeout(limit, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            warn!("backend panicked");
            Err(HandlerError::Other("internal backend error".to_string()))
        }
        Err(_) => Err(HandlerError::Other("request timed out".to_string())),
    }
}

/// Maps a backend error onto the reply for MESSAGE and POLL.
fn failure_reply(err: &HandlerError) -> Reply {
    match err {
        HandlerError::TryAgain => Reply::single(ReplyCode::TRY_AGAIN, err.to_string()),
        HandlerError::PollEmpty => Reply::single(ReplyCode::POLL_EMPTY, err.to_string()),
        _ => Reply::single(ReplyCode::FAILED, single_line(&err.to_string())),
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
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
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::{AsyncRead, AsyncReadExt};

    use super::*;
    use crate::handler::{BodyProducer, BottleId};

    /// Accepts everything and always has one bottle to poll.
    struct Fixed;

    #[async_trait]
    impl Handler for Fixed {
        async fn handle_bottle(
            &self,
            src: &mut (dyn AsyncRead + Send + Unpin),
        ) -> std::result::Result<BottleId, HandlerError> {
            let mut record = Vec::new();
            src.read_to_end(&mut record).await?;
            Ok(format!("len{}", record.len()))
        }

        async fn poll_bottle(
            &self,
        ) -> std::result::Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
            Ok(("b1".into(), Box::new(Bytes::from_static(b"DATA\r\n.x\r\n"))))
        }

        async fn purge_bottle(&self, id: &str) -> std::result::Result<(), HandlerError> {
            if id == "b1" {
                Ok(())
            } else {
                Err(HandlerError::NotFound(id.into()))
            }
        }
    }

    /// Panics on PURGE; otherwise empty.
    struct Panicking;

    #[async_trait]
    impl Handler for Panicking {
        async fn handle_bottle(
            &self,
            _src: &mut (dyn AsyncRead + Send + Unpin),
        ) -> std::result::Result<BottleId, HandlerError> {
            Err(HandlerError::TryAgain)
        }

        async fn poll_bottle(
            &self,
        ) -> std::result::Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
            Err(HandlerError::PollEmpty)
        }

        async fn purge_bottle(&self, id: &str) -> std::result::Result<(), HandlerError> {
            panic!("purge of {id} exploded")
        }
    }

    async fn run(script: tokio_test::io::Mock) {
        let server = Server::new(Arc::new(Fixed), ServerConfig::new());
        server.serve(script).await.unwrap();
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(Command::parse("MESSAGE"), Command::Message);
        assert_eq!(Command::parse("POLL"), Command::Poll);
        assert_eq!(Command::parse("PURGE abc"), Command::Purge("abc".into()));
        assert_eq!(Command::parse("PURGE"), Command::Unknown);
        assert_eq!(Command::parse("PURGE "), Command::Unknown);
        assert_eq!(Command::parse("poll"), Command::Unknown);
        assert_eq!(Command::parse(""), Command::Unknown);
    }

    #[test]
    fn test_failure_reply_codes() {
        assert_eq!(failure_reply(&HandlerError::TryAgain).to_wire(), "301 Try-Again-Later\r\n");
        assert_eq!(failure_reply(&HandlerError::PollEmpty).to_wire(), "401 Poll-Empty\r\n");
        assert_eq!(
            failure_reply(&HandlerError::Other("disk\nfull".into())).to_wire(),
            "501 disk full\r\n"
        );
    }

    #[tokio::test]
    async fn test_message() {
        let script = tokio_test::io::Builder::new()
            .read(b"MESSAGE\r\nFROM:a@x\r\nDATA\r\n..\r\n.\r\n")
            .write(b"201 len19\r\n")
            .build();
        run(script).await;
    }

    #[tokio::test]
    async fn test_poll_streams_dot_stuffed_body() {
        let script = tokio_test::io::Builder::new()
            .read(b"POLL\r\n")
            .write(b"200 ID b1\r\nDATA\r\n..x\r\n.\r\n")
            .build();
        run(script).await;
    }

    #[tokio::test]
    async fn test_purge() {
        let script = tokio_test::io::Builder::new()
            .read(b"PURGE b1\r\n")
            .write(b"201 Purged b1\r\n")
            .read(b"PURGE nope\r\n")
            .write(b"501 bottle not found: nope\r\n")
            .build();
        run(script).await;
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let script = tokio_test::io::Builder::new()
            .read(b"HELO there\r\nPURGE\r\n")
            .write(b"599 Error, unknown command\r\n")
            .write(b"599 Error, unknown command\r\n")
            .build();
        run(script).await;
    }

    #[tokio::test]
    async fn test_read_error_replies_500() {
        let script = tokio_test::io::Builder::new()
            .read(b"POL")
            .read_error(io::Error::other("connection reset"))
            .write(b"500 Internal Server error\r\n")
            .build();
        let server = Server::new(Arc::new(Fixed), ServerConfig::new());
        assert!(server.serve(script).await.is_err());
    }

    #[tokio::test]
    async fn test_backend_panic_fails_one_command() {
        let script = tokio_test::io::Builder::new()
            .read(b"PURGE a\r\nPOLL\r\n")
            .write(b"501 internal backend error\r\n")
            .write(b"401 Poll-Empty\r\n")
            .build();
        let server = Server::new(Arc::new(Panicking), ServerConfig::new());
        server.serve(script).await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_timeout_replies_501() {
        struct Stuck;

        #[async_trait]
        impl Handler for Stuck {
            async fn handle_bottle(
                &self,
                _src: &mut (dyn AsyncRead + Send + Unpin),
            ) -> std::result::Result<BottleId, HandlerError> {
                Err(HandlerError::TryAgain)
            }

            async fn poll_bottle(
                &self,
            ) -> std::result::Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
                std::future::pending().await
            }

            async fn purge_bottle(&self, _id: &str) -> std::result::Result<(), HandlerError> {
                Ok(())
            }
        }

        tokio::time::pause();
        let script = tokio_test::io::Builder::new()
            .read(b"POLL\r\nPURGE x\r\n")
            .write(b"501 request timed out\r\n")
            .write(b"201 Purged x\r\n")
            .build();
        let server = Server::new(
            Arc::new(Stuck),
            ServerConfig::new().request_timeout(Duration::from_secs(1)),
        );
        server.serve(script).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_message_closes() {
        let script = tokio_test::io::Builder::new()
            .read(b"MESSAGE\r\nFROM:a@x\r\n")
            .build();
        let server = Server::new(Arc::new(Fixed), ServerConfig::new());
        let err = server.serve(script).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
