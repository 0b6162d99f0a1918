#![deny(missing_docs)]
//! # kvd
//! A networked, persistent key-value store mapping [`String`] keys to
//! [`String`] values.
//!
//! [`String`]: https://doc.rust-lang.org/std/string/struct.String.html
//!
//! The [`KvdServer`] accepts TCP connections and serves length-framed binary
//! requests (INSERT, UPDATE, DELETE, GET) against a [`MappedStore`], a
//! key-value index persisted in a memory-mapped file and guarded by a
//! machine-wide named mutex so that cooperating processes sharing one
//! storage file stay consistent. The [`KvdClient`] dials a server, frames
//! requests and parses responses. A [`Stats`] counter bank tallies every
//! operation and reports to stderr once a minute.

pub use client::KvdClient;
pub use engine::{MappedStore, StorageEngine};
pub use error::{KvdError, Result};
pub use protocol::{
    ErrorCode, Operation, Request, Response, MAX_KEY_LENGTH, MAX_VALUE_LENGTH,
};
pub use server::{default_pool_size, KvdServer};
pub use session::Session;
pub use stats::{Stats, StatsPrinter, STATS_PRINT_PERIOD};

mod client;
pub mod engine;
mod error;
pub mod protocol;
mod server;
mod session;
mod stats;
pub mod thread_pool;
