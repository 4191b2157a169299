//! The Read Request (RR): an in-flight unit of work (spec §2, §3).

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer_pool::{BucketId, PoolBuffer};
use crate::consumer::ConsumerSink;
use crate::digest::DigestBytes;
use crate::message::DataInfo;
use crate::signal::SpectrumInfo;

/// Outcome of a reaped work completion (spec §3, "ReadRequest lifecycle";
/// §4.3 step 3).
#[derive(Debug)]
pub enum Outcome {
    Success,
    DigestFailure,
    ReadFailure { wc_status: String },
}

/// An in-flight RDMA READ: destination buffer, remote address, expected
/// digest, origin signal metadata, target consumer set, and outcome slot
/// (spec §2, "Read Request (RR)").
pub struct ReadRequest {
    pub server_addr: SocketAddr,
    pub spectrum: SpectrumInfo,
    pub consumers: Vec<Arc<dyn ConsumerSink>>,
    /// Set once a buffer has been allocated at post time (spec §4.4 step 1).
    pub buffer: Option<PoolBuffer>,
    pub bucket: BucketId,
    /// Filled in when the completion is reaped (spec §4.3 step 3).
    pub outcome: Option<Outcome>,
}

impl ReadRequest {
    /// Creates an RR from a signal entry with a non-empty consumer set
    /// (spec §3, "ReadRequest lifecycle").
    pub fn new(
        spectrum: SpectrumInfo,
        consumers: Vec<Arc<dyn ConsumerSink>>,
        bucket: BucketId,
    ) -> ReadRequest {
        debug_assert!(!consumers.is_empty());
        ReadRequest {
            server_addr: spectrum.server_addr,
            spectrum,
            consumers,
            buffer: None,
            bucket,
            outcome: None,
        }
    }

    pub fn expected_digest(&self) -> &DigestBytes {
        &self.spectrum.expected_digest
    }

    pub fn buffer_size(&self) -> usize {
        self.spectrum.buffer_size()
    }

    pub fn data_info(&self) -> DataInfo {
        DataInfo {
            server_addr: self.spectrum.server_addr,
            data_addr: self.spectrum.data_addr,
            num_channels: self.spectrum.num_channels,
            per_channel_size: self.spectrum.per_channel_size,
            expected_digest: self.spectrum.expected_digest,
        }
    }
}
