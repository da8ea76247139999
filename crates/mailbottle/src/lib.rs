//! # mailbottle
//!
//! The Bottle protocol: a small, pipelined, line-oriented protocol for handing
//! accepted mail to a queue and taking it back out for delivery.
//!
//! ## Features
//!
//! - **Pipelining**: many requests in flight on one connection, handled
//!   concurrently, with reads and replies kept in request order
//! - **Streaming bodies**: message bodies flow through as dot-terminated
//!   blocks and are never buffered whole by the protocol layer
//! - **Pluggable backends**: anything implementing [`Handler`] can sit behind
//!   a [`Server`], including another server reached via [`RemoteHandler`]
//!
//! ## Wire Protocol
//!
//! ```text
//! C: MESSAGE                     S: 201 <id>
//! C: <bottle record, dot-block>     301 Try-Again-Later | 501 <error>
//!
//! C: POLL                        S: 200 ID <id>
//!                                S: <bottle record, dot-block>
//!                                   401 Poll-Empty | 501 <error>
//!
//! C: PURGE <id>                  S: 201 Purged <id> | 501 <error>
//! ```
//!
//! Anything else is answered with `599 Error, unknown command`.
//!
//! A bottle record (see [`codec`]) is an envelope header followed by the
//! message body:
//!
//! ```text
//! BODY-8BITMIME
//! FROM:alice@example.com
//! RCPT-TO:bob@example.org
//! DATA
//! <dot-terminated body>
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailbottle::{Server, ServerConfig};
//!
//! let server = Server::new(Arc::new(my_queue), ServerConfig::default());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:2626").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let server = server.clone();
//!     tokio::spawn(async move { server.serve(stream).await });
//! }
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: bottle records and dot-terminated blocks
//! - [`sequencer`]: request/response ordering for pipelined connections
//! - [`framed`]: line reading shared by both ends
//! - [`reply`]: reply codes and parsing

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
pub mod codec;
mod error;
pub mod framed;
mod handler;
mod remote;
pub mod reply;
pub mod sequencer;
mod server;

pub use client::{Client, ClientConfig, PollBody, PolledBottle};
pub use codec::{BodyWriter, BottleInfo, DotReader, DotWriter};
pub use error::{Error, Result};
pub use handler::{BodyProducer, BottleId, Handler, HandlerError};
pub use remote::RemoteHandler;
pub use reply::{Reply, ReplyCode};
pub use sequencer::{Sequencer, Turn};
pub use server::{Server, ServerConfig};
