//! The connection registry: primary index by remote address, secondary
//! index by completion-queue fd (spec §3, "Invariants").

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::rdma::ConnId;

use super::state::CreditTrackedConnection;

/// Dual-indexed connection table. Exactly one CtC per `remote_addr`; the fd
/// index holds an entry iff the CtC has progressed past `resolving_addr`
/// (spec §3). A third index from CM id back to address is an implementation
/// detail for resolving incoming CM events, which only carry a `ConnId`.
#[derive(Default)]
pub struct Registry {
    by_addr: HashMap<SocketAddr, CreditTrackedConnection>,
    by_fd: BTreeMap<RawFd, SocketAddr>,
    by_cm_id: HashMap<ConnId, SocketAddr>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn insert(&mut self, ctc: CreditTrackedConnection) {
        self.by_cm_id.insert(ctc.cm_id, ctc.remote_addr);
        self.by_addr.insert(ctc.remote_addr, ctc);
    }

    pub fn addr_for_cm_id(&self, cm_id: ConnId) -> Option<SocketAddr> {
        self.by_cm_id.get(&cm_id).copied()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&CreditTrackedConnection> {
        self.by_addr.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut CreditTrackedConnection> {
        self.by_addr.get_mut(addr)
    }

    /// Adds `addr`'s completion-channel fd to the secondary index (spec §4.2,
    /// "Address resolved": "Insert CtC into the fd index").
    pub fn index_fd(&mut self, fd: RawFd, addr: SocketAddr) {
        self.by_fd.insert(fd, addr);
    }

    pub fn deindex_fd(&mut self, fd: RawFd) {
        self.by_fd.remove(&fd);
    }

    pub fn get_mut_by_fd(&mut self, fd: RawFd) -> Option<&mut CreditTrackedConnection> {
        let addr = *self.by_fd.get(&fd)?;
        self.by_addr.get_mut(&addr)
    }

    /// Completion-channel fds currently tracked, in ascending order (spec
    /// §4.1, "indices ≥ 2 are completion-channel fds").
    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.by_fd.keys().copied()
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<CreditTrackedConnection> {
        let ctc = self.by_addr.remove(addr)?;
        self.by_cm_id.remove(&ctc.cm_id);
        Some(ctc)
    }

    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.by_addr.keys().copied()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut CreditTrackedConnection> {
        self.by_addr.values_mut()
    }
}
