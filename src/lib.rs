//! Client-side ingest engine for a radio-astronomy correlator that multicasts
//! "signal" advertisements over UDP for spectra held in remote, RDMA-accessible
//! server memory.
//!
//! The [`reactor`] module is the core: a single-threaded event loop that owns
//! every RDMA connection, issues RDMA READs, reaps completions, verifies
//! digests and routes completed (or failed) buffers to consumer queues. The
//! [`buffer_pool`], [`consumer`] and [`signal`] modules are thin, independently
//! testable boundary contracts for collaborators that are out of scope here
//! (the real buffer pool, the real consumer queues, the real UDP signal
//! receiver and filter dispatch).

#[macro_use]
extern crate log;

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod digest;
pub mod error;
mod mpmc;
pub mod message;
pub mod rdma;
pub mod reactor;
pub mod request;
pub mod signal;

pub use client::Client;
pub use config::Config;
pub use error::{ErrorRecord, ReaderError};
pub use message::{ConsumerMessage, DataPathMessage, EndCode, EndResult};
pub use request::ReadRequest;
