//! A [`Handler`] that forwards to another Bottle server.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Error;
use crate::client::{Client, PollBody};
use crate::handler::{BodyProducer, BottleId, Handler, HandlerError};

/// Hands every bottle operation to a remote Bottle server.
///
/// Lets an SMTP front end and the queue run as separate processes: the front
/// end serves SMTP with a `RemoteHandler` as its backend.
#[derive(Debug)]
pub struct RemoteHandler<S> {
    client: Arc<Client<S>>,
}

impl<S> Clone for RemoteHandler<S> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<S> RemoteHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Forwards through `client`.
    #[must_use]
    pub const fn new(client: Arc<Client<S>>) -> Self {
        Self { client }
    }

    /// The client used for forwarding.
    #[must_use]
    pub const fn client(&self) -> &Arc<Client<S>> {
        &self.client
    }
}

fn handler_error(err: Error) -> HandlerError {
    match err {
        e if e.is_try_again() => HandlerError::TryAgain,
        Error::Remote { message, .. } => HandlerError::Other(message),
        Error::Io(e) => HandlerError::Io(e),
        other => HandlerError::Io(io::Error::other(other)),
    }
}

struct RemoteBody<S>(PollBody<S>);

#[async_trait]
impl<S> BodyProducer for RemoteBody<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn produce(self: Box<Self>, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()> {
        match self.0.copy_to(dst).await {
            Ok(_) => Ok(()),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

#[async_trait]
impl<S> Handler for RemoteHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn handle_bottle(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError> {
        self.client.message(src).await.map_err(handler_error)
    }

    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
        match self.client.poll().await {
            Ok(Some(polled)) => Ok((polled.id, Box::new(RemoteBody(polled.body)))),
            Ok(None) => Err(HandlerError::PollEmpty),
            Err(e) => Err(handler_error(e)),
        }
    }

    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError> {
        self.client.purge(id).await.map_err(handler_error)
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
    use crate::client::ClientConfig;

    fn remote(script: tokio_test::io::Mock) -> RemoteHandler<tokio_test::io::Mock> {
        RemoteHandler::new(Arc::new(Client::new(script, ClientConfig::default())))
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            handler_error(Error::remote(301, "Try-Again-Later")),
            HandlerError::TryAgain
        ));
        assert!(matches!(
            handler_error(Error::remote(501, "disk full")),
            HandlerError::Other(m) if m == "disk full"
        ));
        assert!(matches!(handler_error(Error::Closed), HandlerError::Io(_)));
    }

    #[tokio::test]
    async fn test_forward_message() {
        let script = tokio_test::io::Builder::new()
            .write(b"MESSAGE\r\nFROM:a@x\r\nDATA\r\n.\r\n")
            .read(b"201 b1\r\n")
            .build();
        let handler = remote(script);
        let mut src: &[u8] = b"FROM:a@x\r\nDATA\r\n";
        assert_eq!(handler.handle_bottle(&mut src).await.unwrap(), "b1");
    }

    #[tokio::test]
    async fn test_forward_poll() {
        let script = tokio_test::io::Builder::new()
            .write(b"POLL\r\n")
            .read(b"200 ID b1\r\nDATA\r\nhi\r\n.\r\n")
            .write(b"POLL\r\n")
            .read(b"401 Poll-Empty\r\n")
            .build();
        let handler = remote(script);

        let (bid, producer) = handler.poll_bottle().await.unwrap();
        assert_eq!(bid, "b1");
        let mut out = Vec::new();
        producer.produce(&mut out).await.unwrap();
        assert_eq!(out, b"DATA\r\nhi\r\n");

        assert!(matches!(
            handler.poll_bottle().await,
            Err(HandlerError::PollEmpty)
        ));
    }
}
