//! # TickSync Client
//!
//! A reference facility client for the TickSync central server.
//!
//! This crate provides:
//! - A session driver: queue, wait, push, pull, end
//! - Retry with exponential backoff and jitter
//! - A transport abstraction with streamed responses
//! - An in-process loopback transport (feature `loopback`)
//! - A local store abstraction with an in-memory implementation
//!
//! ## Key Invariants
//!
//! - Push happens before pull within a session, so the device's own
//!   changes are never echoed back to it
//! - The sync cursor only advances after a pull has been fully applied
//! - Pending changes are only dropped once the center persisted them
//! - A failure after admission is reported so the session is closed

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod client;
mod config;
mod error;
#[cfg(feature = "loopback")]
mod loopback;
mod store;
mod transport;

pub use client::{ClientStats, SyncClient, SyncOutcome};
pub use config::{ClientConfig, RetryConfig};
pub use error::{ClientError, ClientResult};
#[cfg(feature = "loopback")]
pub use loopback::LoopbackTransport;
pub use store::{ClientStore, LocalRecord, MemoryClientStore};
pub use transport::{ByteStream, SyncTransport};
