//! # mailbottle-smtp
//!
//! SMTP front end for the Bottle protocol. A [`Session`] speaks just enough
//! SMTP to collect an envelope and a message, and streams each message to a
//! [`mailbottle::Handler`] as a bottle record.
//!
//! ## Features
//!
//! - HELO, EHLO, MAIL, RCPT, DATA, QUIT
//! - STARTTLS when TLS material is configured
//! - `BODY=8BITMIME` carried into the bottle header
//! - Message bodies are streamed to the backend, never buffered whole
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailbottle_smtp::{Session, SmtpConfig};
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:2525").await?;
//! let config = Arc::new(SmtpConfig::new().hostname("mx.example.org"));
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let session = Session::new(handler.clone(), config.clone());
//!     tokio::spawn(session.run(stream));
//! }
//! ```
//!
//! ## Session States
//!
//! ```text
//! ┌───────┐  HELO/EHLO  ┌─────────┐  MAIL  ┌────────────┐  RCPT  ┌────────────┐
//! │ Start │ ──────────→ │ Greeted │ ─────→ │ HaveSender │ ─────→ │ HaveRcpts  │
//! └───────┘             └─────────┘        └────────────┘        └────────────┘
//!                                                                      │ DATA
//!                                     envelope reset ←─────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
mod config;
pub mod connection;
mod error;
mod session;
pub mod types;

pub use command::{Command, CommandError};
pub use config::SmtpConfig;
pub use connection::{SmtpConnection, SmtpStream, load_tls};
pub use error::{Error, Result};
pub use session::Session;
pub use types::{Extension, Reply, ReplyCode};
