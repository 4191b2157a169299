//! The per-connection state machine: `CreditTrackedConnection` (CtC) and its
//! `ConnState` (spec §3, §4.2).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::buffer_pool::BucketId;
use crate::rdma::{ConnId, MrHandle};
use crate::request::ReadRequest;

/// Lifecycle states a connection passes through (spec §3, "state").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    ResolvingAddr,
    ResolvingRoute,
    Connecting,
    Established,
    Disconnecting,
    Dead,
}

/// A credit-tracked RDMA connection to one server address (spec §3,
/// "CreditTrackedConnection").
pub struct CreditTrackedConnection {
    pub remote_addr: SocketAddr,
    pub cm_id: ConnId,
    pub state: ConnState,
    /// Valid only in `Established` (spec §3, "established ⇔ rkey set ∧ ...").
    pub rkey: Option<u32>,
    /// Credit ceiling; monotonically non-increasing after negotiation
    /// (spec §8 property 3).
    pub max_posted: u32,
    pub num_posted: u32,
    pub num_not_ack: u32,
    pub min_ack: u32,
    pub mrs: HashMap<BucketId, MrHandle>,
    pub pending: VecDeque<ReadRequest>,
    /// RRs posted but not yet reaped, keyed by work-request id (spec §4.3
    /// step 2, "Recover the RR from the work-request id").
    pub in_flight: HashMap<u64, ReadRequest>,
    pub last_access: Instant,
    next_wr_id: u64,
    /// Last (bucket, mr) pair consulted; consecutive RRs commonly share a
    /// bucket (spec §4.4 step 2).
    mr_cache: Option<(BucketId, MrHandle)>,
}

impl CreditTrackedConnection {
    pub fn new(remote_addr: SocketAddr, cm_id: ConnId, max_posted: u32) -> CreditTrackedConnection {
        CreditTrackedConnection {
            remote_addr,
            cm_id,
            state: ConnState::ResolvingAddr,
            rkey: None,
            max_posted,
            num_posted: 0,
            num_not_ack: 0,
            min_ack: 1,
            mrs: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            last_access: Instant::now(),
            next_wr_id: 0,
            mr_cache: None,
        }
    }

    pub fn has_credit(&self) -> bool {
        self.num_posted < self.max_posted
    }

    /// Never raises the ceiling, only ever lowers it (spec §4.2, "Re-tighten
    /// max_posted"; §8 property 3).
    pub fn tighten_max_posted(&mut self, candidate: u32) {
        self.max_posted = self.max_posted.min(candidate);
    }

    pub fn mr_for(&mut self, bucket: BucketId) -> Option<MrHandle> {
        if let Some((cached_bucket, mr)) = self.mr_cache {
            if cached_bucket == bucket {
                return Some(mr);
            }
        }
        let mr = *self.mrs.get(&bucket)?;
        self.mr_cache = Some((bucket, mr));
        Some(mr)
    }

    pub fn next_wr_id(&mut self) -> u64 {
        let id = self.next_wr_id;
        self.next_wr_id += 1;
        id
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_access.elapsed() >= timeout
    }

    /// Drops every RR still waiting to be posted, releasing their buffers
    /// (spec §4.2, "Disconnect": pending RRs are dropped with no per-RR
    /// consumer notification).
    pub fn drop_pending(&mut self) {
        self.pending.clear();
    }

    pub fn is_drained(&self) -> bool {
        self.num_posted == 0
    }
}
