//! The Completion Handler (spec §4.3): reaping work completions from one
//! connection's completion queue, classifying outcomes, and delivering
//! messages to consumer queues.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::connection::Registry;
use crate::digest;
use crate::error::{ErrorSink, ReaderError};
use crate::message::{ConsumerMessage, DataInfo};
use crate::rdma::{Verbs, WcStatus};
use crate::request::Outcome;

use super::cm_events::try_complete_disconnect;
use super::post::post_pending;

/// Processes one readable completion-channel fd end to end (spec §4.3 steps
/// 1-7).
pub fn handle_fd<V: Verbs, P: BufferPool>(
    registry: &mut Registry,
    verbs: &mut V,
    pool: &P,
    fd: RawFd,
    errors: &mut ErrorSink,
) {
    let addr = match registry.get_mut_by_fd(fd) {
        Some(ctc) => ctc.remote_addr,
        None => return,
    };

    // Step 2: acquire the CQ event, bump `num_not_ack`, ack in bulk once past
    // `min_ack`, and re-arm for one more notification.
    let (cm_id, max_posted) = {
        let ctc = registry.get_mut(&addr).unwrap();
        (ctc.cm_id, ctc.max_posted)
    };
    if let Err(e) = verbs.get_cq_event(cm_id) {
        errors.push(ReaderError::Io(e));
        return;
    }
    {
        let ctc = registry.get_mut(&addr).unwrap();
        ctc.num_not_ack += 1;
        if ctc.num_not_ack >= ctc.min_ack.max(1) {
            verbs.ack_cq_events(cm_id, ctc.num_not_ack);
            ctc.num_not_ack = 0;
        }
    }
    if let Err(e) = verbs.request_notify_cq(cm_id) {
        errors.push(ReaderError::Io(e));
    }

    // Step 3: drain completions into a transient local list before any
    // delivery, so every RR is reachable from exactly one place at a time
    // (spec §3, "Invariants").
    let completions = verbs.poll_cq(cm_id, max_posted.max(1) as usize);
    let mut reaped = Vec::with_capacity(completions.len());
    {
        let ctc = registry.get_mut(&addr).unwrap();
        for wc in completions {
            ctc.num_posted = ctc.num_posted.saturating_sub(1);
            if let Some(rr) = ctc.in_flight.remove(&wc.wr_id) {
                reaped.push((rr, wc.status));
            }
        }
        ctc.touch();
    }

    // Step 3 continued: classify and deliver.
    for (mut rr, status) in reaped {
        let data_info = rr.data_info();
        let outcome = classify(&rr.buffer, &data_info, &status);
        let msg = message_for(&outcome, data_info, rr.buffer.take());
        for consumer in &rr.consumers {
            let _ = consumer.push(msg.clone());
        }
        rr.outcome = Some(outcome);
    }

    // Step 5: post more reads up to remaining credit.
    {
        let ctc = registry.get_mut(&addr).unwrap();
        post_pending(ctc, verbs, pool, errors);
    }

    // Step 7: complete a pending disconnect if this drain emptied it out.
    try_complete_disconnect(registry, verbs, &addr);
}

fn classify(
    buffer: &Option<crate::buffer_pool::PoolBuffer>,
    data_info: &DataInfo,
    status: &WcStatus,
) -> Outcome {
    match status {
        WcStatus::Error(desc) => Outcome::ReadFailure {
            wc_status: desc.clone(),
        },
        WcStatus::Success => match buffer {
            Some(buf) if digest::verify(buf, &data_info.expected_digest) => Outcome::Success,
            _ => Outcome::DigestFailure,
        },
    }
}

fn message_for(
    outcome: &Outcome,
    data_info: DataInfo,
    buffer: Option<crate::buffer_pool::PoolBuffer>,
) -> ConsumerMessage {
    match outcome {
        Outcome::Success => ConsumerMessage::ValidBuffer {
            data_info,
            // `buffer` is `Some` whenever `outcome == Success` (see
            // `classify`): the digest can only be computed on an allocated
            // buffer.
            buffer: Arc::new(buffer.expect("success outcome without a buffer")),
        },
        Outcome::DigestFailure => ConsumerMessage::DigestFailure { data_info },
        Outcome::ReadFailure { wc_status } => ConsumerMessage::RdmaReadFailure {
            data_info,
            wc_status: wc_status.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::HeapBufferPool;
    use crate::connection::{ConnState, CreditTrackedConnection};
    use crate::consumer::ChannelConsumer;
    use crate::digest::{self, DigestBytes};
    use crate::rdma::mock::MockVerbs;
    use crate::rdma::WorkCompletion;
    use crate::request::ReadRequest;
    use crate::signal::SpectrumInfo;

    fn addr() -> std::net::SocketAddr {
        "127.0.0.1:9300".parse().unwrap()
    }

    fn setup() -> (MockVerbs, HeapBufferPool, Registry, crate::buffer_pool::BucketId) {
        let mut verbs = MockVerbs::new();
        let cm_id = verbs.create_id();
        verbs.create_qp(cm_id, 4).unwrap();
        let pool = HeapBufferPool::new(vec![64], 8);
        let bucket = pool.bucket_for(64);
        let mr = verbs.reg_mr(cm_id, bucket).unwrap();

        let mut ctc = CreditTrackedConnection::new(addr(), cm_id, 4);
        ctc.state = ConnState::Established;
        ctc.rkey = Some(7);
        ctc.min_ack = 1;
        ctc.mrs.insert(bucket, mr);

        let mut registry = Registry::new();
        registry.insert(ctc);
        let cq_fd = verbs.cq_fd(cm_id);
        registry.index_fd(cq_fd, addr());
        (verbs, pool, registry, bucket)
    }

    #[test]
    fn successful_read_with_matching_digest_delivers_valid_buffer() {
        let (mut verbs, pool, mut registry, bucket) = setup();
        let payload = vec![7u8; 64];
        let expected: DigestBytes = digest::compute(&payload);

        let (sink, rx) = ChannelConsumer::new(8);
        let sink: Arc<dyn crate::consumer::ConsumerSink> = Arc::new(sink);
        let spectrum = SpectrumInfo {
            server_addr: addr(),
            data_addr: 0x2000,
            num_channels: 1,
            per_channel_size: 64,
            expected_digest: expected,
        };
        {
            let ctc = registry.get_mut(&addr()).unwrap();
            ctc.pending
                .push_back(ReadRequest::new(spectrum, vec![sink], bucket));
            let cm_id = ctc.cm_id;
            verbs.script_read_payload(cm_id, payload);
        }
        let mut errors = ErrorSink::new();
        {
            let ctc = registry.get_mut(&addr()).unwrap();
            post_pending(ctc, &mut verbs, &pool, &mut errors);
        }
        assert_eq!(registry.get(&addr()).unwrap().num_posted, 1);

        let cm_id = registry.get(&addr()).unwrap().cm_id;
        verbs.push_completion(
            cm_id,
            WorkCompletion {
                wr_id: 0,
                status: WcStatus::Success,
            },
        );
        let fd = verbs.cq_fd(cm_id);
        handle_fd(&mut registry, &mut verbs, &pool, fd, &mut errors);

        assert!(errors.is_empty());
        assert_eq!(registry.get(&addr()).unwrap().num_posted, 0);
        match rx.try_recv().unwrap() {
            ConsumerMessage::ValidBuffer { .. } => {}
            other => panic!("expected ValidBuffer, got a different variant: {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn digest_mismatch_reports_digest_failure() {
        let (mut verbs, pool, mut registry, bucket) = setup();
        let (sink, rx) = ChannelConsumer::new(8);
        let sink: Arc<dyn crate::consumer::ConsumerSink> = Arc::new(sink);
        let spectrum = SpectrumInfo {
            server_addr: addr(),
            data_addr: 0x2000,
            num_channels: 1,
            per_channel_size: 64,
            expected_digest: [0xffu8; 16],
        };
        {
            let ctc = registry.get_mut(&addr()).unwrap();
            ctc.pending
                .push_back(ReadRequest::new(spectrum, vec![sink], bucket));
        }
        let mut errors = ErrorSink::new();
        {
            let ctc = registry.get_mut(&addr()).unwrap();
            post_pending(ctc, &mut verbs, &pool, &mut errors);
        }
        let cm_id = registry.get(&addr()).unwrap().cm_id;
        verbs.push_completion(
            cm_id,
            WorkCompletion {
                wr_id: 0,
                status: WcStatus::Success,
            },
        );
        let fd = verbs.cq_fd(cm_id);
        handle_fd(&mut registry, &mut verbs, &pool, fd, &mut errors);

        assert!(matches!(
            rx.try_recv().unwrap(),
            ConsumerMessage::DigestFailure { .. }
        ));
    }

    #[test]
    fn read_failure_status_reports_rdma_read_failure() {
        let (mut verbs, pool, mut registry, bucket) = setup();
        let (sink, rx) = ChannelConsumer::new(8);
        let sink: Arc<dyn crate::consumer::ConsumerSink> = Arc::new(sink);
        let spectrum = SpectrumInfo {
            server_addr: addr(),
            data_addr: 0x2000,
            num_channels: 1,
            per_channel_size: 64,
            expected_digest: [0u8; 16],
        };
        {
            let ctc = registry.get_mut(&addr()).unwrap();
            ctc.pending
                .push_back(ReadRequest::new(spectrum, vec![sink], bucket));
        }
        let mut errors = ErrorSink::new();
        {
            let ctc = registry.get_mut(&addr()).unwrap();
            post_pending(ctc, &mut verbs, &pool, &mut errors);
        }
        let cm_id = registry.get(&addr()).unwrap().cm_id;
        verbs.push_completion(
            cm_id,
            WorkCompletion {
                wr_id: 0,
                status: WcStatus::Error("remote access error".into()),
            },
        );
        let fd = verbs.cq_fd(cm_id);
        handle_fd(&mut registry, &mut verbs, &pool, fd, &mut errors);

        assert!(matches!(
            rx.try_recv().unwrap(),
            ConsumerMessage::RdmaReadFailure { .. }
        ));
    }
}
