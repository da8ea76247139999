//! SMTP session: collects an envelope and hands each message to a
//! [`Handler`] as a bottle.
//!
//! The session is sequential. On DATA the client's body is copied, still
//! streaming, through a bottle writer into an in-process pipe whose other
//! end is read by the backend in its own task:
//!
//! ```text
//! client ──DotReader──► BodyWriter ──duplex──► Handler::handle_bottle
//! ```

use std::sync::Arc;

use mailbottle::codec::{self, BottleInfo, DotReader};
use mailbottle::{BottleId, Handler, HandlerError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::connection::SmtpConnection;
use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};
use crate::SmtpConfig;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// What the run loop does after a command.
enum Flow {
    Continue,
    Quit,
    Upgrade(TlsAcceptor),
}

/// One SMTP session.
pub struct Session {
    handler: Arc<dyn Handler>,
    config: Arc<SmtpConfig>,
    acceptor: Option<TlsAcceptor>,
    /// Name the client gave in HELO/EHLO.
    client: Option<String>,
    envelope: BottleInfo,
}

impl Session {
    /// Creates a session that delivers to `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>, config: Arc<SmtpConfig>) -> Self {
        let acceptor = config.tls.clone().map(TlsAcceptor::from);
        Self {
            handler,
            config,
            acceptor,
            client: None,
            envelope: BottleInfo::new(),
        }
    }

    /// Greets the client and serves commands until QUIT or hang-up.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a timeout, or a failed TLS
    /// handshake.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = SmtpConnection::new(stream, self.config.max_line_length);
        let greeting = format!("{} service ready", self.config.hostname);
        conn.send(&Reply::single(ReplyCode::SERVICE_READY, greeting))
            .await?;

        loop {
            let Some(line) = self.next_line(&mut conn).await? else {
                debug!("client hung up");
                return Ok(());
            };

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(err) => {
                    debug!(%err, "rejected command");
                    conn.send(&err.reply()).await?;
                    continue;
                }
            };
            debug!(?command, "command");

            match self.dispatch(command, &mut conn).await? {
                Flow::Continue => {}
                Flow::Quit => {
                    conn.shutdown().await?;
                    return Ok(());
                }
                Flow::Upgrade(acceptor) => {
                    conn = conn.upgrade(&acceptor).await?;
                    // The client starts over on the encrypted channel.
                    self.client = None;
                    self.envelope = BottleInfo::new();
                    info!("TLS established");
                }
            }
        }
    }

    async fn next_line<S>(&self, conn: &mut SmtpConnection<S>) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limit = self.config.command_timeout;
        tokio::time::timeout(limit, conn.read_line())
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    async fn dispatch<S>(&mut self, command: Command, conn: &mut SmtpConnection<S>) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match command {
            Command::Helo { hostname } => {
                self.client = Some(hostname);
                conn.send(&ok()).await?;
            }
            Command::Ehlo { hostname } => {
                self.client = Some(hostname);
                let mut lines = vec![self.config.hostname.clone()];
                lines.extend(
                    self.config
                        .extensions(conn.is_tls())
                        .iter()
                        .map(ToString::to_string),
                );
                conn.send(&Reply::new(ReplyCode::OK, lines)).await?;
            }
            Command::MailFrom { from, mime8b } => {
                self.envelope.from.push(from);
                self.envelope.mime8b |= mime8b;
                conn.send(&ok()).await?;
            }
            Command::RcptTo { to } => {
                self.envelope.rcpt_to.push(to);
                conn.send(&ok()).await?;
            }
            Command::Data => self.data(conn).await?,
            Command::Quit => {
                conn.send(&Reply::single(ReplyCode::CLOSING, "closing channel"))
                    .await?;
                return Ok(Flow::Quit);
            }
            Command::StartTls => match &self.acceptor {
                Some(acceptor) if !conn.is_tls() => {
                    conn.send(&Reply::single(ReplyCode::SERVICE_READY, "go ahead"))
                        .await?;
                    return Ok(Flow::Upgrade(acceptor.clone()));
                }
                _ => {
                    conn.send(&Reply::single(
                        ReplyCode::NOT_IMPLEMENTED,
                        "Command not implemented",
                    ))
                    .await?;
                }
            },
        }
        Ok(Flow::Continue)
    }

    /// Runs one DATA transfer.
    ///
    /// A backend failure is answered with 554 and then 250, and the session
    /// goes on. The envelope is cleared either way.
    async fn data<S>(&mut self, conn: &mut SmtpConnection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.envelope.is_complete() {
            return conn
                .send(&Reply::single(
                    ReplyCode::BAD_SEQUENCE,
                    "Bad sequence of commands",
                ))
                .await;
        }
        conn.send(&Reply::single(ReplyCode::START_DATA, "start mail input"))
            .await?;

        let limit = self.config.data_timeout;
        let deadline = Instant::now() + limit;
        let (pipe, mut backend_end) = tokio::io::duplex(self.config.pipe_capacity);
        let handler = Arc::clone(&self.handler);
        let mut backend: JoinHandle<std::result::Result<BottleId, HandlerError>> =
            tokio::spawn(async move { handler.handle_bottle(&mut backend_end).await });

        let info = std::mem::take(&mut self.envelope);
        debug!(
            client = self.client.as_deref().unwrap_or("-"),
            from = ?info.from,
            rcpt_to = ?info.rcpt_to,
            "bridging message"
        );

        match tokio::time::timeout_at(deadline, bridge(&info, pipe, conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                backend.abort();
                return Err(e);
            }
            Err(_) => {
                backend.abort();
                return Err(Error::Timeout(limit));
            }
        }

        let outcome = match tokio::time::timeout_at(deadline, &mut backend).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(HandlerError::Other(join.to_string())),
            Err(_) => {
                backend.abort();
                Err(HandlerError::Other("backend timed out".into()))
            }
        };

        match outcome {
            Ok(bid) => info!(%bid, "accepted message"),
            Err(err) => {
                warn!(%err, "backend refused message");
                conn.send(&Reply::single(
                    ReplyCode::TRANSACTION_FAILED,
                    "Transaction failed",
                ))
                .await?;
            }
        }
        conn.send(&ok()).await
    }
}

/// Copies the client's dot-terminated body into a bottle on `pipe`.
///
/// If the backend stops reading, the rest of the body is still consumed so
/// the session stays in step with the client.
async fn bridge<S>(info: &BottleInfo, pipe: DuplexStream, conn: &mut SmtpConnection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut writer = match codec::write_info(pipe, info).await {
        Ok(writer) => Some(writer),
        Err(e) => {
            debug!(error = %e, "backend closed before the envelope was written");
            None
        }
    };

    let mut body = DotReader::new(conn.reader());
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(w) = writer.as_mut()
            && let Err(e) = w.write_all(&buf[..n]).await
        {
            debug!(error = %e, "backend stopped reading; discarding rest of body");
            writer = None;
        }
    }

    if let Some(writer) = writer
        && let Err(e) = writer.close().await
    {
        debug!(error = %e, "backend closed before the body was terminated");
    }
    Ok(())
}

fn ok() -> Reply {
    Reply::single(ReplyCode::OK, "OK")
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mailbottle::BodyProducer;
    use mailbottle_queue::MemoryQueue;
    use tokio_test::io::Builder;

    use super::*;

    /// Counts calls and refuses every bottle.
    #[derive(Default)]
    struct Refusing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Refusing {
        async fn handle_bottle(
            &self,
            _src: &mut (dyn AsyncRead + Send + Unpin),
        ) -> std::result::Result<BottleId, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Other("disk full".into()))
        }

        async fn poll_bottle(
            &self,
        ) -> std::result::Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
            Err(HandlerError::PollEmpty)
        }

        async fn purge_bottle(&self, id: &str) -> std::result::Result<(), HandlerError> {
            Err(HandlerError::NotFound(id.to_string()))
        }
    }

    fn session(handler: Arc<dyn Handler>) -> Session {
        Session::new(handler, Arc::new(SmtpConfig::default()))
    }

    #[tokio::test]
    async fn test_happy_path() {
        let queue = MemoryQueue::default();
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"HELO client\r\n")
            .write(b"250 OK\r\n")
            .read(b"MAIL FROM:<a@x>\r\n")
            .write(b"250 OK\r\n")
            .read(b"RCPT TO:<b@y>\r\n")
            .write(b"250 OK\r\n")
            .read(b"DATA\r\n")
            .write(b"354 start mail input\r\n")
            .read(b"Subject: hi\r\n\r\n..dot\r\n.\r\n")
            .write(b"250 OK\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 closing channel\r\n")
            .build();

        session(Arc::new(queue.clone())).run(mock).await.unwrap();

        let bottles = queue.bottles();
        assert_eq!(bottles.len(), 1);
        assert_eq!(bottles[0].info.from, vec!["a@x"]);
        assert_eq!(bottles[0].info.rcpt_to, vec!["b@y"]);
        assert!(!bottles[0].info.mime8b);

        let mut info = BottleInfo::new();
        let mut body = Vec::new();
        codec::read_info(&bottles[0].record[..], &mut info)
            .await
            .unwrap()
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, b"Subject: hi\r\n\r\n.dot\r\n");
    }

    #[tokio::test]
    async fn test_8bitmime_and_multiple_recipients() {
        let queue = MemoryQueue::default();
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"MAIL FROM:<a@x> BODY=8BITMIME\r\n")
            .write(b"250 OK\r\n")
            .read(b"RCPT TO:<b@y>\r\n")
            .write(b"250 OK\r\n")
            .read(b"RCPT TO:<c@y>\r\n")
            .write(b"250 OK\r\n")
            .read(b"DATA\r\n")
            .write(b"354 start mail input\r\n")
            .read(b"caf\xc3\xa9\r\n.\r\n")
            .write(b"250 OK\r\n")
            .build();

        session(Arc::new(queue.clone())).run(mock).await.unwrap();

        let bottles = queue.bottles();
        assert_eq!(bottles[0].info.rcpt_to, vec!["b@y", "c@y"]);
        assert!(bottles[0].info.mime8b);
    }

    #[tokio::test]
    async fn test_data_before_envelope() {
        let handler = Arc::new(Refusing::default());
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"DATA\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .read(b"MAIL FROM:<a@x>\r\n")
            .write(b"250 OK\r\n")
            .read(b"DATA\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .build();

        session(handler.clone()).run(mock).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure() {
        let handler = Arc::new(Refusing::default());
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"MAIL FROM:<a@x>\r\n")
            .write(b"250 OK\r\n")
            .read(b"RCPT TO:<b@y>\r\n")
            .write(b"250 OK\r\n")
            .read(b"DATA\r\n")
            .write(b"354 start mail input\r\n")
            .read(b"line one\r\nline two\r\n.\r\n")
            .write(b"554 Transaction failed\r\n")
            .write(b"250 OK\r\n")
            // The envelope was spent on the failed attempt.
            .read(b"DATA\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 closing channel\r\n")
            .build();

        session(handler.clone()).run(mock).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ehlo_without_tls() {
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"EHLO client\r\n")
            .write(b"250-localhost\r\n250 8BITMIME\r\n")
            .read(b"STARTTLS\r\n")
            .write(b"502 Command not implemented\r\n")
            .read(b"HELO client\r\n")
            .write(b"250 OK\r\n")
            .build();

        session(Arc::new(MemoryQueue::default()))
            .run(mock)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_syntax_errors() {
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"\r\n")
            .write(b"500 Syntax error, command unrecognized\r\n")
            .read(b"HELO\r\n")
            .write(b"501 parameter\r\n")
            .read(b"MAIL FROM:a@x\r\n")
            .write(b"501 invalid parameter\r\n")
            .read(b"RSET\r\n")
            .write(b"502 Command not implemented\r\n")
            .read(b"quit\r\n")
            .write(b"221 closing channel\r\n")
            .build();

        session(Arc::new(MemoryQueue::default()))
            .run(mock)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_truncated_body_ends_session() {
        let queue = MemoryQueue::default();
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .read(b"MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\n")
            .write(b"250 OK\r\n")
            .write(b"250 OK\r\n")
            .read(b"DATA\r\n")
            .write(b"354 start mail input\r\n")
            .read(b"no terminator\r\n")
            .build();

        let err = session(Arc::new(queue.clone())).run(mock).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_client_times_out() {
        let config = SmtpConfig::default().command_timeout(std::time::Duration::from_secs(5));
        let mock = Builder::new()
            .write(b"220 localhost service ready\r\n")
            .wait(std::time::Duration::from_secs(10))
            .build();

        let err = Session::new(Arc::new(MemoryQueue::default()), Arc::new(config))
            .run(mock)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
