//! Backend capability behind a Bottle server.
//!
//! A [`Handler`] is whatever actually stores bottles: an in-memory queue, a
//! remote Bottle server reached over a [`Client`](crate::Client), or a test
//! double. The protocol layer only moves bytes and identifiers between the
//! wire and the handler.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Opaque bottle identifier minted by the backend.
pub type BottleId = String;

/// Errors a backend reports to the protocol layer.
///
/// [`TryAgain`](Self::TryAgain) and [`PollEmpty`](Self::PollEmpty) have their
/// own reply codes; everything else becomes a generic failure reply carrying
/// the error text.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Backend is temporarily unable to accept the bottle.
    #[error("Try-Again-Later")]
    TryAgain,

    /// No bottle is waiting to be polled.
    #[error("Poll-Empty")]
    PollEmpty,

    /// The referenced bottle does not exist.
    #[error("bottle not found: {0}")]
    NotFound(BottleId),

    /// The bottle record was rejected.
    #[error("invalid bottle: {0}")]
    Invalid(String),

    /// I/O error while reading or writing bottle data.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Streams a polled bottle into the connection.
#[async_trait]
pub trait BodyProducer: Send {
    /// Writes the whole bottle record to `dst`.
    ///
    /// The protocol layer takes care of dot-stuffing and termination.
    async fn produce(self: Box<Self>, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()>;
}

#[async_trait]
impl BodyProducer for Bytes {
    async fn produce(self: Box<Self>, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()> {
        dst.write_all(&self).await
    }
}

#[async_trait]
impl BodyProducer for Vec<u8> {
    async fn produce(self: Box<Self>, dst: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()> {
        dst.write_all(&self).await
    }
}

/// Queue backend reached through the Bottle protocol.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Accepts a bottle record read from `src` and returns its identifier.
    ///
    /// `src` ends where the record ends. The handler need not read all of it;
    /// the server discards whatever is left.
    ///
    /// # Errors
    ///
    /// [`HandlerError::TryAgain`] asks the peer to retry later; any other
    /// error rejects the bottle.
    async fn handle_bottle(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError>;

    /// Hands out the next queued bottle.
    ///
    /// # Errors
    ///
    /// [`HandlerError::PollEmpty`] if nothing is waiting.
    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError>;

    /// Removes a bottle after it has been delivered.
    ///
    /// # Errors
    ///
    /// [`HandlerError::NotFound`] if no such bottle exists.
    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
    async fn handle_bottle(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BottleId, HandlerError> {
        (**self).handle_bottle(src).await
    }

    async fn poll_bottle(&self) -> Result<(BottleId, Box<dyn BodyProducer>), HandlerError> {
        (**self).poll_bottle().await
    }

    async fn purge_bottle(&self, id: &str) -> Result<(), HandlerError> {
        (**self).purge_bottle(id).await
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

    #[tokio::test]
    async fn test_bytes_producer_writes_everything() {
        let producer: Box<dyn BodyProducer> = Box::new(Bytes::from_static(b"FROM:a@x\r\n"));
        let mut out = Vec::new();
        producer.produce(&mut out).await.unwrap();
        assert_eq!(out, b"FROM:a@x\r\n");
    }

    #[test]
    fn test_sentinel_texts() {
        assert_eq!(HandlerError::TryAgain.to_string(), "Try-Again-Later");
        assert_eq!(HandlerError::PollEmpty.to_string(), "Poll-Empty");
        assert_eq!(
            HandlerError::NotFound("b1".into()).to_string(),
            "bottle not found: b1"
        );
    }
}
