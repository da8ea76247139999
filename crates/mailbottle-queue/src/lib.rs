//! # mailbottle-queue
//!
//! An in-memory bottle queue that implements the [`mailbottle::Handler`]
//! backend capability. Serve it with a [`mailbottle::Server`] to get a
//! working Bottle queue, or hand it straight to an SMTP front end.
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailbottle::{Server, ServerConfig};
//! use mailbottle_queue::{MemoryQueue, QueueConfig};
//!
//! let queue = Arc::new(MemoryQueue::new(QueueConfig::default().capacity(1000)));
//! let server = Server::new(queue, ServerConfig::default());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
mod memory;

pub use config::QueueConfig;
pub use memory::{MemoryQueue, QueuedBottle};
