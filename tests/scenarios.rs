//! Black-box scenario tests driven entirely through the public `Client` API
//! (spec §8, scenarios S1-S6), exercising the reactor on its own thread the
//! way a real caller would rather than poking its internals directly.

mod support;

use std::time::Duration;

use spectrum_reader::config::Config;
use spectrum_reader::message::{ConsumerMessage, EndCode};
use spectrum_reader::rdma::{DeviceAttrs, mock::MockVerbs};

use support::*;

#[test]
fn s1_happy_path_delivers_valid_buffer_then_end() {
    let client = open_client(Config::default());
    let (sink, rx) = new_consumer(8);

    client.send(announce(spectrum(server_addr(19100), zero_buffer_digest()), vec![sink]));

    match recv(&rx) {
        ConsumerMessage::ValidBuffer { .. } => {}
        other => panic!("expected ValidBuffer, got {:?}", std::mem::discriminant(&other)),
    }

    let mut client = client;
    client.quit();
    client.wait_for_exit();
    match recv(&rx) {
        ConsumerMessage::End(result) => assert_eq!(result.code, EndCode::NoError),
        other => panic!("expected End, got {:?}", std::mem::discriminant(&other)),
    }
}

#[test]
fn s2_digest_mismatch_is_reported_without_ending_the_connection() {
    let client = open_client(Config::default());
    let (sink, rx) = new_consumer(8);

    let wrong_digest = [0xffu8; 16];
    client.send(announce(spectrum(server_addr(19101), wrong_digest), vec![sink.clone()]));
    match recv(&rx) {
        ConsumerMessage::DigestFailure { .. } => {}
        other => panic!("expected DigestFailure, got {:?}", std::mem::discriminant(&other)),
    }

    // The connection survives a digest failure: a second, correctly-digested
    // request on the same address still completes.
    client.send(announce(spectrum(server_addr(19101), zero_buffer_digest()), vec![sink]));
    match recv(&rx) {
        ConsumerMessage::ValidBuffer { .. } => {}
        other => panic!("expected ValidBuffer, got {:?}", std::mem::discriminant(&other)),
    }

    client.quit_and_join();
}

#[test]
fn s5_graceful_shutdown_drains_in_flight_work_before_end() {
    let client = open_client(Config::default());
    let (sink, rx) = new_consumer(64);

    let addrs = [19102u16, 19103, 19104];
    let mut sent = 0;
    for port in addrs {
        for _ in 0..5 {
            client.send(announce(spectrum(server_addr(port), zero_buffer_digest()), vec![sink.clone()]));
            sent += 1;
        }
    }

    let mut client = client;
    client.quit();

    let mut valid = 0;
    loop {
        match recv(&rx) {
            ConsumerMessage::ValidBuffer { .. } => valid += 1,
            ConsumerMessage::End(result) => {
                assert_eq!(result.code, EndCode::NoError);
                break;
            }
            other => panic!("unexpected message: {:?}", std::mem::discriminant(&other)),
        }
    }
    assert_eq!(valid, sent, "every in-flight read should complete before end");
    client.wait_for_exit();
}

/// Property #8 (double-`Quit` idempotence), not spec §8's S6 — see
/// `s6_credit_negotiation_clamps_to_peer_depth` below for the actual S6.
#[test]
fn quit_is_idempotent_and_still_reaches_end_exactly_once() {
    let mut client = open_client(Config::default());
    let (sink, rx) = new_consumer(8);
    client.send(announce(spectrum(server_addr(19105), zero_buffer_digest()), vec![sink]));
    assert!(matches!(recv(&rx), ConsumerMessage::ValidBuffer { .. }));

    client.quit();
    client.quit();
    client.wait_for_exit();

    assert!(matches!(recv(&rx), ConsumerMessage::End(_)));
    assert!(rx.try_recv().is_err(), "end must be the last message on the queue");
}

#[test]
fn s3_peer_reject_ends_with_syserr() {
    let mut verbs = MockVerbs::new_autopilot();
    verbs.set_autopilot_rejects(true);
    let client = open_client_with(verbs, Config::default());
    let (sink, rx) = new_consumer(8);

    let addr = server_addr(19106);
    client.send(announce(spectrum(addr, zero_buffer_digest()), vec![sink]));

    match recv(&rx) {
        ConsumerMessage::End(result) => {
            assert_eq!(result.code, EndCode::Syserr);
            let desc = result.syserr_desc.as_deref().unwrap_or("");
            assert!(
                desc.to_lowercase().contains("rejected"),
                "description should mention the rejection: {desc}"
            );
            assert!(
                desc.contains(&addr.to_string()),
                "description should mention the remote address: {desc}"
            );
        }
        other => panic!("expected End, got {:?}", std::mem::discriminant(&other)),
    }

    let mut client = client;
    client.wait_for_exit();
}

#[test]
fn s4_inactivity_eviction_then_reopen() {
    let mut config = Config::default();
    config.inactive_server_timeout_sec = 0;
    let verbs = MockVerbs::new_autopilot();
    let stats = verbs.stats();
    let client = open_client_with(verbs, config);
    let (sink, rx) = new_consumer(8);
    let addr = server_addr(19107);

    client.send(announce(spectrum(addr, zero_buffer_digest()), vec![sink.clone()]));
    assert!(matches!(recv(&rx), ConsumerMessage::ValidBuffer { .. }));

    // `inactive_server_timeout_sec = 0` makes the connection idle the moment
    // it's touched, so the next sweep (every ~1ms) evicts it.
    std::thread::sleep(Duration::from_millis(50));

    client.send(announce(spectrum(addr, zero_buffer_digest()), vec![sink]));
    assert!(matches!(recv(&rx), ConsumerMessage::ValidBuffer { .. }));

    assert!(
        stats.connect_calls() >= 2,
        "second delivery should have required a fresh connect after eviction, got {} connect calls",
        stats.connect_calls()
    );

    let mut client = client;
    client.quit();
    client.wait_for_exit();
}

#[test]
fn s6_credit_negotiation_clamps_to_peer_depth() {
    let mut verbs = MockVerbs::new_autopilot();
    verbs.set_default_device_attrs(DeviceAttrs { max_qp_init_rd_atom: 64 });
    verbs.set_autopilot_peer_initiator_depth(16);
    let stats = verbs.stats();

    let mut config = Config::default();
    config.rdma_read_max_posted = 256;

    let client = open_client_with(verbs, config);
    let (sink, rx) = new_consumer(64);
    let addr = server_addr(19108);

    // More requests than the negotiated depth, bundled into one signal
    // message so they all land in `pending` before the connection ever
    // reaches `established` (spec §8, S6): `config.rdma_read_max_posted =
    // 256`, device caps at 64, peer `initiator_depth = 16` => final
    // `max_posted` must be 16, so posting can never outrun that cap.
    let total: usize = 40;
    let spectra: Vec<_> = (0..total).map(|_| spectrum(addr, zero_buffer_digest())).collect();
    client.send(announce_many(spectra, sink));

    let mut valid: usize = 0;
    while valid < total {
        match recv(&rx) {
            ConsumerMessage::ValidBuffer { .. } => valid += 1,
            other => panic!("unexpected message: {:?}", std::mem::discriminant(&other)),
        }
    }

    assert_eq!(
        stats.peak_outstanding_posts(),
        16,
        "max_posted should have clamped to the peer's initiator_depth of 16"
    );

    client.quit_and_join();
}
