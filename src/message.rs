//! Control-channel and consumer-output message types (spec §3, §6).

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer_pool::PoolBuffer;
use crate::digest::DigestBytes;
use crate::signal::SignalMsg;

/// Messages flowing on the control channel between the signal receiver (or
/// the reactor's own loopback) and the reactor (spec §3, "DataPathMessage").
pub enum DataPathMessage {
    /// A signal advertising spectra, with per-spectrum consumer sets already
    /// attached by the filter dispatch.
    SignalMsg(SignalMsg),
    /// The signal receiver failed to receive a datagram.
    ReceiveFail { wc_status: String },
    /// The signal receiver could not obtain a buffer from its pool.
    BufferStarvation,
    /// Initiates phase 1 of shutdown (spec §4.7). Carries an identity token so
    /// the reactor can recognize the *same* instance cycling back through the
    /// loopback (the `Arc` pointer is the identity).
    Quit(QuitToken),
    /// Phase 2 of shutdown: terminates the reactor (spec §4.7).
    End(EndResult),
}

/// Identity token for the quit/end two-phase protocol (spec §4.7, §9
/// "Control-pipe pointer-passing"). Two `QuitToken`s are the *same* quit
/// request iff `Arc::ptr_eq` holds, which is what lets the reactor tell its
/// own loopback echo apart from a fresh `Quit` arriving concurrently.
#[derive(Clone)]
pub struct QuitToken(std::sync::Arc<()>);

impl QuitToken {
    pub fn new() -> QuitToken {
        QuitToken(std::sync::Arc::new(()))
    }

    pub fn is(&self, other: &QuitToken) -> bool {
        std::sync::Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for QuitToken {
    fn default() -> QuitToken {
        QuitToken::new()
    }
}

/// The final `End` message's result code (spec §6, §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndCode {
    NoError,
    Syserr,
    ErrorBuffpool,
}

/// The final `End` message payload (spec §6, "end{result{code, syserr_desc?}}").
#[derive(Clone, Debug)]
pub struct EndResult {
    pub code: EndCode,
    pub syserr_desc: Option<String>,
}

impl EndResult {
    pub fn no_error() -> EndResult {
        EndResult {
            code: EndCode::NoError,
            syserr_desc: None,
        }
    }

    pub fn syserr(desc: String) -> EndResult {
        EndResult {
            code: EndCode::Syserr,
            syserr_desc: Some(desc),
        }
    }

    pub fn error_buffpool() -> EndResult {
        EndResult {
            code: EndCode::ErrorBuffpool,
            syserr_desc: None,
        }
    }
}

/// Metadata identifying which spectrum a message pertains to, carried on
/// every non-`end` consumer message.
#[derive(Clone, Debug)]
pub struct DataInfo {
    pub server_addr: SocketAddr,
    pub data_addr: u64,
    pub num_channels: u32,
    pub per_channel_size: u32,
    pub expected_digest: DigestBytes,
}

/// Messages delivered to a consumer's queue (spec §6, table of variants).
///
/// `Clone` because one RR's consumer set commonly fans out to several
/// consumer queues sharing a single completed read (spec §4.5, "transfer
/// ownership of the consumer list to the RR"); the buffer itself is shared
/// via `Arc` and returns to the pool once every consumer has dropped its
/// copy.
#[derive(Clone)]
pub enum ConsumerMessage {
    /// RR completed successfully and the digest verified.
    ValidBuffer {
        data_info: DataInfo,
        buffer: Arc<PoolBuffer>,
    },
    /// RR completed but the computed MD5 did not match the expected digest.
    /// `valid_buffer` and this variant share the same underlying slot in the
    /// original design: the buffer is released before enqueue (spec §6).
    DigestFailure { data_info: DataInfo },
    /// RR completion status was not success.
    RdmaReadFailure { data_info: DataInfo, wc_status: String },
    /// Buffer-pool allocation failed when posting a read (spec §4.4).
    DataBufferStarvation,
    /// The signal receiver could not obtain a buffer.
    SignalBufferStarvation,
    /// The signal receiver's own verb failed.
    SignalReceiveFailure { wc_status: String },
    /// Final message on every consumer queue (spec §8, property 5).
    End(EndResult),
}
