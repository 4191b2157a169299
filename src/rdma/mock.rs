//! An in-process, scriptable software backend for the reactor's own tests
//! (spec §3a, §8). No hardware, no kernel RDMA modules: CM events and work
//! completions are pushed by test code, and the fds the reactor polls are
//! real `eventfd(2)` descriptors so the reactor's actual `poll(2)`-based
//! pollset is exercised end to end, not bypassed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};

use crate::buffer_pool::BucketId;

use super::verbs::{
    CmErrorKind, CmEvent, ConnId, DeviceAttrs, MrHandle, PrivateData, QpCaps, Verbs, WcStatus,
    WorkCompletion,
};

#[derive(Default)]
struct StatsInner {
    connect_calls: u32,
    outstanding_posts: u32,
    outstanding_posts_peak: u32,
}

/// A cloneable handle onto counters a test can inspect once `MockVerbs` has
/// been moved into the reactor's own thread (spec §8, scenarios S4/S6): grab
/// one with [`MockVerbs::stats`] before handing the backend to
/// [`crate::Client::open`].
#[derive(Clone, Default)]
pub struct MockVerbsStats(Arc<Mutex<StatsInner>>);

impl MockVerbsStats {
    /// Times `rdma_connect` was issued. More than one for a single address
    /// proves a reconnect actually happened rather than the same connection
    /// living on (spec §8, S4).
    pub fn connect_calls(&self) -> u32 {
        self.0.lock().unwrap().connect_calls
    }

    /// The highest number of RDMA READs posted and not yet reaped at any one
    /// instant across the backend's whole lifetime. Should never exceed the
    /// negotiated `max_posted` (spec §8, S6).
    pub fn peak_outstanding_posts(&self) -> u32 {
        self.0.lock().unwrap().outstanding_posts_peak
    }
}

struct EventFd(RawFd);

impl EventFd {
    fn new() -> EventFd {
        let fd = eventfd(0, EfdFlags::EFD_NONBLOCK).expect("eventfd creation failed");
        EventFd(fd)
    }

    fn bump(&self) {
        let one: u64 = 1;
        let _ = write(self.0, &one.to_ne_bytes());
    }

    /// Clears the counter. Safe to call even when not currently readable
    /// thanks to `EFD_NONBLOCK`.
    fn clear(&self) {
        let mut buf = [0u8; 8];
        let _ = read(self.0, &mut buf);
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

struct MockConn {
    cq_fd: EventFd,
    cq_queue: VecDeque<WorkCompletion>,
    notify_armed: bool,
    mrs: HashSet<BucketId>,
    max_send_wr: u32,
    device_attrs: DeviceAttrs,
    /// Scripted payload bytes consumed FIFO, one entry per `post_read` call
    /// (spec §8, scenarios S1/S2: lets a test control what a READ "returns").
    read_payloads: VecDeque<Vec<u8>>,
}

/// Scriptable software RDMA verbs backend.
pub struct MockVerbs {
    cm_fd: EventFd,
    cm_queue: VecDeque<(ConnId, CmEvent)>,
    next_id: u64,
    connections: HashMap<ConnId, MockConn>,
    /// Device cap applied to every connection unless overridden via
    /// [`MockVerbs::set_device_attrs`].
    default_device_attrs: DeviceAttrs,
    /// When set, `resolve_addr`/`resolve_route`/`connect` self-enqueue the CM
    /// event a real provider would eventually deliver, and a successful
    /// `post_read` self-enqueues its own completion. This lets a caller drive
    /// a whole connection end to end through nothing but the public
    /// `Client`/signal API, without reaching into the backend to script each
    /// step by hand — useful for integration tests that only see `Client`.
    /// Off by default so the reactor's own fine-grained unit tests keep
    /// full manual control over event ordering.
    autopilot: bool,
    autopilot_rkey: u32,
    /// When set, `connect` delivers `CmEvent::Error(Rejected)` instead of
    /// `Established` (spec §8, S3).
    autopilot_rejects: bool,
    /// Overrides the `initiator_depth` autopilot echoes back in `Established`
    /// private data, modeling a peer that grants a narrower depth than was
    /// requested (spec §8, S6). `None` just echoes what was asked for.
    autopilot_peer_initiator_depth: Option<u32>,
    stats: MockVerbsStats,
}

impl MockVerbs {
    pub fn new() -> MockVerbs {
        MockVerbs {
            cm_fd: EventFd::new(),
            cm_queue: VecDeque::new(),
            next_id: 0,
            connections: HashMap::new(),
            default_device_attrs: DeviceAttrs {
                max_qp_init_rd_atom: 128,
            },
            autopilot: false,
            autopilot_rkey: 0xC0FF_EE00,
            autopilot_rejects: false,
            autopilot_peer_initiator_depth: None,
            stats: MockVerbsStats::default(),
        }
    }

    /// A backend that drives itself through the full CM handshake and
    /// completes every posted read immediately with `WcStatus::Success`.
    pub fn new_autopilot() -> MockVerbs {
        MockVerbs {
            autopilot: true,
            ..MockVerbs::new()
        }
    }

    pub fn set_default_device_attrs(&mut self, attrs: DeviceAttrs) {
        self.default_device_attrs = attrs;
    }

    /// Makes every future autopilot `connect` reject instead of establish
    /// (spec §8, S3).
    pub fn set_autopilot_rejects(&mut self, rejects: bool) {
        self.autopilot_rejects = rejects;
    }

    /// Makes autopilot's `Established` event carry `depth` as the peer's
    /// `initiator_depth`, regardless of what was requested (spec §8, S6).
    pub fn set_autopilot_peer_initiator_depth(&mut self, depth: u32) {
        self.autopilot_peer_initiator_depth = Some(depth);
    }

    /// A cloneable handle to this backend's counters, to inspect after it has
    /// been moved into a [`crate::Client`]'s reactor thread.
    pub fn stats(&self) -> MockVerbsStats {
        self.stats.clone()
    }

    /// Scripts a CM event to be delivered the next time the reactor polls the
    /// CM fd (spec §4.2).
    pub fn push_cm_event(&mut self, id: ConnId, event: CmEvent) {
        self.cm_queue.push_back((id, event));
        self.cm_fd.bump();
    }

    /// Scripts a work completion on `id`'s completion queue. Only bumps the
    /// cq fd if a notification is currently armed, mirroring one-shot
    /// `ibv_req_notify_cq` semantics (spec §4.2, "Request one completion
    /// notification").
    pub fn push_completion(&mut self, id: ConnId, wc: WorkCompletion) {
        let conn = self.connections.get_mut(&id).expect("unknown connection");
        conn.cq_queue.push_back(wc);
        if conn.notify_armed {
            conn.notify_armed = false;
            conn.cq_fd.bump();
        }
    }

    pub fn outstanding_completions(&self, id: ConnId) -> usize {
        self.connections.get(&id).map(|c| c.cq_queue.len()).unwrap_or(0)
    }

    /// Queues bytes to be copied into the local buffer of the next
    /// `post_read` issued on `id`. Shorter than the destination: copied as a
    /// prefix, rest left zeroed. Longer: truncated.
    pub fn script_read_payload(&mut self, id: ConnId, bytes: Vec<u8>) {
        self.connections
            .get_mut(&id)
            .expect("create_qp must precede scripting a payload")
            .read_payloads
            .push_back(bytes);
    }
}

impl Default for MockVerbs {
    fn default() -> MockVerbs {
        MockVerbs::new()
    }
}

impl Verbs for MockVerbs {
    fn cm_fd(&self) -> RawFd {
        self.cm_fd.0
    }

    fn create_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    fn resolve_addr(&mut self, id: ConnId, _addr: SocketAddr, _timeout: Duration) -> std::io::Result<()> {
        if self.autopilot {
            self.push_cm_event(id, CmEvent::AddrResolved);
        }
        Ok(())
    }

    fn resolve_route(&mut self, id: ConnId, _timeout: Duration) -> std::io::Result<()> {
        if self.autopilot {
            self.push_cm_event(id, CmEvent::RouteResolved);
        }
        Ok(())
    }

    fn query_device(&self, id: ConnId) -> std::io::Result<DeviceAttrs> {
        Ok(self
            .connections
            .get(&id)
            .map(|c| c.device_attrs)
            .unwrap_or(self.default_device_attrs))
    }

    fn create_qp(&mut self, id: ConnId, requested_send_wr: u32) -> std::io::Result<QpCaps> {
        self.connections.insert(
            id,
            MockConn {
                cq_fd: EventFd::new(),
                cq_queue: VecDeque::new(),
                notify_armed: false,
                mrs: HashSet::new(),
                max_send_wr: requested_send_wr,
                device_attrs: self.default_device_attrs,
                read_payloads: VecDeque::new(),
            },
        );
        Ok(QpCaps {
            max_send_wr: requested_send_wr,
        })
    }

    fn reg_mr(&mut self, id: ConnId, bucket: BucketId) -> std::io::Result<MrHandle> {
        let conn = self
            .connections
            .get_mut(&id)
            .expect("create_qp must precede reg_mr");
        conn.mrs.insert(bucket);
        Ok(MrHandle(bucket.0 as u64))
    }

    fn dereg_mr(&mut self, id: ConnId, mr: MrHandle) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.mrs.remove(&BucketId(mr.0 as usize));
        }
    }

    fn cq_fd(&self, id: ConnId) -> RawFd {
        self.connections.get(&id).expect("unknown connection").cq_fd.0
    }

    fn request_notify_cq(&mut self, id: ConnId) -> std::io::Result<()> {
        let conn = self.connections.get_mut(&id).expect("unknown connection");
        conn.notify_armed = true;
        Ok(())
    }

    fn connect(&mut self, id: ConnId, initiator_depth: u32) -> std::io::Result<()> {
        self.stats.0.lock().unwrap().connect_calls += 1;
        if self.autopilot {
            if self.autopilot_rejects {
                self.push_cm_event(id, CmEvent::Error(CmErrorKind::Rejected));
            } else {
                let rkey = self.autopilot_rkey;
                let initiator_depth = self.autopilot_peer_initiator_depth.unwrap_or(initiator_depth);
                self.push_cm_event(
                    id,
                    CmEvent::Established(PrivateData {
                        rkey,
                        initiator_depth,
                    }),
                );
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, _id: ConnId) -> std::io::Result<()> {
        Ok(())
    }

    fn destroy_qp(&mut self, _id: ConnId) {}

    fn destroy_id(&mut self, id: ConnId) {
        self.connections.remove(&id);
    }

    fn get_cm_event(&mut self) -> Option<(ConnId, CmEvent)> {
        let event = self.cm_queue.pop_front();
        if event.is_some() {
            self.cm_fd.clear();
        }
        event
    }

    fn get_cq_event(&mut self, id: ConnId) -> std::io::Result<()> {
        let conn = self.connections.get_mut(&id).expect("unknown connection");
        conn.cq_fd.clear();
        Ok(())
    }

    fn ack_cq_events(&mut self, _id: ConnId, _count: u32) {}

    fn post_read(
        &mut self,
        id: ConnId,
        wr_id: u64,
        _remote_addr: u64,
        _rkey: u32,
        mr: MrHandle,
        local: &mut [u8],
    ) -> std::io::Result<()> {
        let conn = self.connections.get_mut(&id).expect("unknown connection");
        if !conn.mrs.contains(&BucketId(mr.0 as usize)) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "memory region not registered",
            ));
        }
        if let Some(payload) = conn.read_payloads.pop_front() {
            let n = payload.len().min(local.len());
            local[..n].copy_from_slice(&payload[..n]);
            for b in &mut local[n..] {
                *b = 0;
            }
        }
        {
            let mut stats = self.stats.0.lock().unwrap();
            stats.outstanding_posts += 1;
            stats.outstanding_posts_peak = stats.outstanding_posts_peak.max(stats.outstanding_posts);
        }
        if self.autopilot {
            self.push_completion(
                id,
                WorkCompletion {
                    wr_id,
                    status: WcStatus::Success,
                },
            );
        }
        Ok(())
    }

    fn poll_cq(&mut self, id: ConnId, max: usize) -> Vec<WorkCompletion> {
        let conn = self.connections.get_mut(&id).expect("unknown connection");
        let n = max.min(conn.cq_queue.len());
        let drained: Vec<_> = conn.cq_queue.drain(..n).collect();
        if n > 0 {
            let mut stats = self.stats.0.lock().unwrap();
            stats.outstanding_posts = stats.outstanding_posts.saturating_sub(n as u32);
        }
        drained
    }
}
