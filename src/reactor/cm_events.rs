//! The CM Event Handler (spec §4.2) and the shared connection-teardown path
//! used by it, the inactivity sweep, and the quit protocol.

use std::net::SocketAddr;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::connection::{ConnState, CreditTrackedConnection, Registry};
use crate::error::{ErrorSink, ReaderError};
use crate::rdma::{CmEvent, Verbs};

use super::post::post_pending;

/// Finds-or-opens a CtC for `addr` and returns it (spec §4.2, "Open").
/// A fresh CtC starts in `ResolvingAddr`; the CM id is created and address
/// resolution kicked off immediately.
pub fn open_connection<V: Verbs>(
    registry: &mut Registry,
    verbs: &mut V,
    addr: SocketAddr,
    config: &Config,
    errors: &mut ErrorSink,
) {
    if registry.get(&addr).is_some() {
        return;
    }
    let cm_id = verbs.create_id();
    registry.insert(CreditTrackedConnection::new(
        addr,
        cm_id,
        config.rdma_read_max_posted,
    ));
    if let Err(e) = verbs.resolve_addr(cm_id, addr, config.resolve_addr_timeout()) {
        errors.push(ReaderError::Io(e));
        begin_disconnect(registry, verbs, &addr, errors);
    }
}

/// Processes exactly one ready CM event, if any (spec §4.1 step 2).
/// Returns `true` iff an event was consumed (whether or not it resolved to a
/// known connection).
pub fn handle_one<V: Verbs, P: BufferPool>(
    registry: &mut Registry,
    verbs: &mut V,
    pool: &P,
    config: &Config,
    errors: &mut ErrorSink,
) -> bool {
    let (cm_id, event) = match verbs.get_cm_event() {
        Some(e) => e,
        None => return false,
    };
    let addr = match registry.addr_for_cm_id(cm_id) {
        Some(a) => a,
        None => return true,
    };
    match event {
        CmEvent::AddrResolved => on_addr_resolved(registry, verbs, &addr, config, errors),
        CmEvent::RouteResolved => on_route_resolved(registry, verbs, &addr, pool, errors),
        CmEvent::Established(private_data) => {
            if let Some(ctc) = registry.get_mut(&addr) {
                ctc.rkey = Some(private_data.rkey);
                ctc.tighten_max_posted(private_data.initiator_depth);
                ctc.min_ack = config.min_ack(ctc.max_posted).max(1);
                ctc.state = ConnState::Established;
                ctc.touch();
                // Anything queued while resolving (spec §3, "preconnect
                // backlog") becomes postable the instant credit is known.
                post_pending(ctc, verbs, pool, errors);
            }
        }
        CmEvent::Disconnected => begin_disconnect(registry, verbs, &addr, errors),
        CmEvent::Error(kind) => {
            errors.push(ReaderError::Cm { addr, kind });
            begin_disconnect(registry, verbs, &addr, errors);
        }
    }
    true
}

fn on_addr_resolved<V: Verbs>(
    registry: &mut Registry,
    verbs: &mut V,
    addr: &SocketAddr,
    config: &Config,
    errors: &mut ErrorSink,
) {
    let cm_id = match registry.get(addr) {
        Some(ctc) => ctc.cm_id,
        None => return,
    };
    let device = match verbs.query_device(cm_id) {
        Ok(d) => d,
        Err(e) => {
            errors.push(ReaderError::Io(e));
            begin_disconnect(registry, verbs, addr, errors);
            return;
        }
    };
    let requested = {
        let ctc = registry.get_mut(addr).unwrap();
        ctc.tighten_max_posted(device.max_qp_init_rd_atom);
        ctc.max_posted
    };
    match verbs.create_qp(cm_id, requested) {
        Ok(caps) => {
            let ctc = registry.get_mut(addr).unwrap();
            ctc.tighten_max_posted(caps.max_send_wr);
            ctc.state = ConnState::ResolvingRoute;
            let cq_fd = verbs.cq_fd(cm_id);
            registry.index_fd(cq_fd, *addr);
            if let Err(e) = verbs.resolve_route(cm_id, config.resolve_route_timeout()) {
                errors.push(ReaderError::Io(e));
                begin_disconnect(registry, verbs, addr, errors);
            }
        }
        Err(e) => {
            errors.push(ReaderError::Io(e));
            begin_disconnect(registry, verbs, addr, errors);
        }
    }
}

fn on_route_resolved<V: Verbs, P: BufferPool>(
    registry: &mut Registry,
    verbs: &mut V,
    addr: &SocketAddr,
    pool: &P,
    errors: &mut ErrorSink,
) {
    let cm_id = match registry.get(addr) {
        Some(ctc) => ctc.cm_id,
        None => return,
    };
    for &bucket in pool.buckets() {
        match verbs.reg_mr(cm_id, bucket) {
            Ok(mr) => {
                registry.get_mut(addr).unwrap().mrs.insert(bucket, mr);
            }
            Err(e) => {
                errors.push(ReaderError::Io(e));
                begin_disconnect(registry, verbs, addr, errors);
                return;
            }
        }
    }
    if let Err(e) = verbs.request_notify_cq(cm_id) {
        errors.push(ReaderError::Io(e));
    }
    let initiator_depth = {
        let ctc = registry.get_mut(addr).unwrap();
        ctc.state = ConnState::Connecting;
        ctc.max_posted
    };
    if let Err(e) = verbs.connect(cm_id, initiator_depth) {
        errors.push(ReaderError::Io(e));
        begin_disconnect(registry, verbs, addr, errors);
    }
}

/// Begins tearing down a connection: drops pending RRs, issues
/// `rdma_disconnect` if currently established, and completes the teardown
/// immediately if there was nothing in flight (spec §4.2, "Disconnect").
pub fn begin_disconnect<V: Verbs>(
    registry: &mut Registry,
    verbs: &mut V,
    addr: &SocketAddr,
    errors: &mut ErrorSink,
) {
    let was_established = match registry.get_mut(addr) {
        Some(ctc) => {
            if matches!(ctc.state, ConnState::Dead | ConnState::Disconnecting) {
                return;
            }
            ctc.drop_pending();
            let established = ctc.state == ConnState::Established;
            ctc.state = ConnState::Disconnecting;
            established
        }
        None => return,
    };
    if was_established {
        let cm_id = registry.get(addr).unwrap().cm_id;
        if let Err(e) = verbs.disconnect(cm_id) {
            errors.push(ReaderError::Io(e));
        }
    }
    try_complete_disconnect(registry, verbs, addr);
}

/// Finishes tearing down a connection once all outstanding work has drained
/// (spec §4.2, "Disconnect completion"). Returns `true` if the connection was
/// removed.
pub fn try_complete_disconnect<V: Verbs>(registry: &mut Registry, verbs: &mut V, addr: &SocketAddr) -> bool {
    let ready = match registry.get(addr) {
        Some(ctc) => ctc.state == ConnState::Disconnecting && ctc.is_drained(),
        None => return false,
    };
    if !ready {
        return false;
    }
    let ctc = registry.get_mut(addr).unwrap();
    let cm_id = ctc.cm_id;
    let num_not_ack = ctc.num_not_ack;
    let mrs: Vec<_> = ctc.mrs.values().copied().collect();
    if num_not_ack > 0 {
        // Flush fully on disconnect rather than waiting for `min_ack` (spec
        // §4.3, "Credit discipline": "threshold set to 1").
        verbs.ack_cq_events(cm_id, num_not_ack);
    }
    for mr in mrs {
        verbs.dereg_mr(cm_id, mr);
    }
    let cq_fd = verbs.cq_fd(cm_id);
    registry.deindex_fd(cq_fd);
    // The queue pair is destroyed unconditionally after drain (spec §9,
    // "Queue-pair destroy omission").
    verbs.destroy_qp(cm_id);
    verbs.destroy_id(cm_id);
    registry.remove(addr);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferPool, HeapBufferPool};
    use crate::rdma::mock::MockVerbs;

    fn cfg() -> Config {
        Config::default()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    fn pool() -> HeapBufferPool {
        HeapBufferPool::new(vec![64], 8)
    }

    #[test]
    fn open_connection_inserts_and_kicks_off_resolution() {
        let mut registry = Registry::new();
        let mut verbs = MockVerbs::new();
        let mut errors = ErrorSink::new();
        open_connection(&mut registry, &mut verbs, addr(), &cfg(), &mut errors);
        assert!(registry.get(&addr()).is_some());
        assert!(errors.is_empty());
    }

    #[test]
    fn full_handshake_reaches_established() {
        let mut registry = Registry::new();
        let mut verbs = MockVerbs::new();
        let mut errors = ErrorSink::new();
        let config = cfg();
        let pool = pool();
        open_connection(&mut registry, &mut verbs, addr(), &config, &mut errors);
        let cm_id = registry.get(&addr()).unwrap().cm_id;

        verbs.push_cm_event(cm_id, CmEvent::AddrResolved);
        assert!(handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors));
        assert_eq!(registry.get(&addr()).unwrap().state, ConnState::ResolvingRoute);

        verbs.push_cm_event(cm_id, CmEvent::RouteResolved);
        assert!(handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors));
        assert_eq!(registry.get(&addr()).unwrap().state, ConnState::Connecting);

        verbs.push_cm_event(
            cm_id,
            CmEvent::Established(crate::rdma::PrivateData {
                rkey: 0xdead_beef,
                initiator_depth: 8,
            }),
        );
        assert!(handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors));
        let ctc = registry.get(&addr()).unwrap();
        assert_eq!(ctc.state, ConnState::Established);
        assert_eq!(ctc.rkey, Some(0xdead_beef));
        assert!(errors.is_empty());
    }

    #[test]
    fn established_posts_backlog_queued_while_resolving() {
        let mut registry = Registry::new();
        let mut verbs = MockVerbs::new();
        let mut errors = ErrorSink::new();
        let config = cfg();
        let pool = pool();
        open_connection(&mut registry, &mut verbs, addr(), &config, &mut errors);
        let cm_id = registry.get(&addr()).unwrap().cm_id;

        verbs.push_cm_event(cm_id, CmEvent::AddrResolved);
        handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors);
        verbs.push_cm_event(cm_id, CmEvent::RouteResolved);
        handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors);

        let bucket = pool.bucket_for(64);
        let (sink, _rx) = crate::consumer::ChannelConsumer::new(8);
        let sink: std::sync::Arc<dyn crate::consumer::ConsumerSink> = std::sync::Arc::new(sink);
        registry.get_mut(&addr()).unwrap().pending.push_back(crate::request::ReadRequest::new(
            crate::signal::SpectrumInfo {
                server_addr: addr(),
                data_addr: 0x1000,
                num_channels: 4,
                per_channel_size: 16,
                expected_digest: [0u8; 16],
            },
            vec![sink],
            bucket,
        ));

        verbs.push_cm_event(
            cm_id,
            CmEvent::Established(crate::rdma::PrivateData {
                rkey: 0xdead_beef,
                initiator_depth: 8,
            }),
        );
        handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors);
        assert_eq!(registry.get(&addr()).unwrap().num_posted, 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn rejected_tears_down_connection() {
        let mut registry = Registry::new();
        let mut verbs = MockVerbs::new();
        let mut errors = ErrorSink::new();
        let config = cfg();
        let pool = pool();
        open_connection(&mut registry, &mut verbs, addr(), &config, &mut errors);
        let cm_id = registry.get(&addr()).unwrap().cm_id;
        verbs.push_cm_event(cm_id, CmEvent::Error(crate::rdma::CmErrorKind::Rejected));
        handle_one(&mut registry, &mut verbs, &pool, &config, &mut errors);
        assert!(registry.get(&addr()).is_none());
        assert!(!errors.is_empty());
    }
}
