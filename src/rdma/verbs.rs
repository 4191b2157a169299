//! Shared types and the [`Verbs`] trait itself.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::buffer_pool::BucketId;

/// Opaque handle to a CM id / queue pair pair. Backends are free to make this
/// whatever they like internally; the reactor only ever compares and copies
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Opaque handle to a registered memory region for one (connection, bucket)
/// pair (spec §3, "mrs").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// Device attributes relevant to credit negotiation (spec §4.2, "Address
/// resolved").
#[derive(Clone, Copy, Debug)]
pub struct DeviceAttrs {
    pub max_qp_init_rd_atom: u32,
}

/// What came back from `create_qp`, after the provider may have rounded the
/// requested depth (spec §4.2, "Address resolved": "Re-tighten `max_posted`
/// ... after creation").
#[derive(Clone, Copy, Debug)]
pub struct QpCaps {
    pub max_send_wr: u32,
}

/// The peer's connect-time private data (spec §6, "Connect-time private
/// data"). The first 32 bits are the server's rkey, read in native byte
/// order with no endian conversion — this assumes matched endianness between
/// peers, which is faithful to the system this engine was modeled on
/// (spec §9, "Byte-order of peer `rkey`").
#[derive(Clone, Copy, Debug)]
pub struct PrivateData {
    pub rkey: u32,
    pub initiator_depth: u32,
}

/// CM error event kinds (spec §4.2, "CM error events").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmErrorKind {
    AddrError,
    RouteError,
    ConnectError,
    Unreachable,
    Rejected,
}

/// A connection-manager event, tagged with the connection it pertains to
/// (spec §4.2).
#[derive(Clone, Copy, Debug)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    Established(PrivateData),
    Disconnected,
    Error(CmErrorKind),
}

/// Status of a reaped work completion (spec §4.3 step 3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error(String),
}

/// A reaped work completion: the work-request id is the RR's slot index in
/// the owning connection's outstanding-work table (spec §4.3, "Recover the RR
/// from the work-request id").
#[derive(Clone, Debug)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
}

/// The RDMA verbs seam the reactor is generic over (spec §3a).
///
/// All methods are non-blocking / immediate: the reactor drives everything
/// from its own poll loop (spec §4.1, "Suspension points: None within a
/// tick").
pub trait Verbs {
    /// The fd to poll for CM events (pollset index 0, spec §4.1).
    fn cm_fd(&self) -> RawFd;

    /// Creates a reliable-connected CM id (spec §4.2, "Open").
    fn create_id(&mut self) -> ConnId;

    fn resolve_addr(&mut self, id: ConnId, addr: SocketAddr, timeout: Duration) -> std::io::Result<()>;

    fn resolve_route(&mut self, id: ConnId, timeout: Duration) -> std::io::Result<()>;

    fn query_device(&self, id: ConnId) -> std::io::Result<DeviceAttrs>;

    /// Creates a queue pair sized to `requested_send_wr` (spec §4.2, "Address
    /// resolved"): receive side is nominal since this is a READ-only client.
    fn create_qp(&mut self, id: ConnId, requested_send_wr: u32) -> std::io::Result<QpCaps>;

    /// Registers a buffer-pool bucket as a memory region against this id's
    /// protection domain (spec §4.2, "Route resolved").
    fn reg_mr(&mut self, id: ConnId, bucket: BucketId) -> std::io::Result<MrHandle>;

    fn dereg_mr(&mut self, id: ConnId, mr: MrHandle);

    /// The completion-channel fd for this connection (pollset indices ≥ 2,
    /// spec §4.1).
    fn cq_fd(&self, id: ConnId) -> RawFd;

    /// Requests one completion notification (spec §4.2, "Route resolved").
    fn request_notify_cq(&mut self, id: ConnId) -> std::io::Result<()>;

    /// Issues `rdma_connect` with the given `initiator_depth` (spec §4.2,
    /// "Route resolved").
    fn connect(&mut self, id: ConnId, initiator_depth: u32) -> std::io::Result<()>;

    fn disconnect(&mut self, id: ConnId) -> std::io::Result<()>;

    /// Destroys the queue pair. Drains are the caller's responsibility
    /// (spec §9, "Queue-pair destroy omission": this implementation destroys
    /// unconditionally after drain rather than skipping it).
    fn destroy_qp(&mut self, id: ConnId);

    fn destroy_id(&mut self, id: ConnId);

    /// Pops one ready CM event, if any (spec §4.1 step 2).
    fn get_cm_event(&mut self) -> Option<(ConnId, CmEvent)>;

    /// Acquires a completion-queue event from the channel, incrementing
    /// `num_not_ack` bookkeeping the caller holds (spec §4.3 step 2).
    fn get_cq_event(&mut self, id: ConnId) -> std::io::Result<()>;

    /// Acks `count` outstanding completion events (spec §4.3 step 2, §4.2
    /// "Disconnect completion": "pass threshold 1").
    fn ack_cq_events(&mut self, id: ConnId, count: u32);

    /// Issues an RDMA READ of `local.len()` bytes from `remote_addr` at
    /// `rkey` into `local`, which must fall within the registered region
    /// `mr`, tagged with `wr_id` (spec §4.4 step 3).
    fn post_read(
        &mut self,
        id: ConnId,
        wr_id: u64,
        remote_addr: u64,
        rkey: u32,
        mr: MrHandle,
        local: &mut [u8],
    ) -> std::io::Result<()>;

    /// Polls up to `max` work completions (spec §4.3 step 3).
    fn poll_cq(&mut self, id: ConnId, max: usize) -> Vec<WorkCompletion>;
}
