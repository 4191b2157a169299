//! Shared helpers for the black-box scenario tests (spec §8, scenarios
//! S1-S6). Every scenario drives a real `Client` over a `MockVerbs` backend
//! in autopilot mode, rather than reaching into reactor internals, since the
//! reactor runs on its own thread once `Client::open` hands it off.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use spectrum_reader::buffer_pool::HeapBufferPool;
use spectrum_reader::config::Config;
use spectrum_reader::consumer::{ChannelConsumer, ConsumerSink};
use spectrum_reader::digest::{self, DigestBytes};
use spectrum_reader::message::{ConsumerMessage, DataPathMessage};
use spectrum_reader::rdma::mock::MockVerbs;
use spectrum_reader::signal::{SignalMsg, SpectrumAnnouncement, SpectrumInfo};
use spectrum_reader::Client;

pub const BUFFER_SIZE: usize = 64;

pub fn server_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// A brand-new `HeapBufferPool` hands out zero-filled buffers until a buffer
/// is returned and reused, so a read that nothing scripts a payload for
/// reads back as all zero bytes.
pub fn zero_buffer_digest() -> DigestBytes {
    digest::compute(&vec![0u8; BUFFER_SIZE])
}

pub fn spectrum(addr: SocketAddr, expected_digest: DigestBytes) -> SpectrumInfo {
    SpectrumInfo {
        server_addr: addr,
        data_addr: 0x2000,
        num_channels: 4,
        per_channel_size: (BUFFER_SIZE / 4) as u32,
        expected_digest,
    }
}

pub fn announce(spectrum: SpectrumInfo, consumers: Vec<Arc<dyn ConsumerSink>>) -> DataPathMessage {
    DataPathMessage::SignalMsg(SignalMsg::new(vec![SpectrumAnnouncement { spectrum, consumers }]))
}

/// Bundles many spectra, all bound for the same consumer, into a single
/// signal message so every entry lands in one control-channel dispatch
/// instead of trickling in one per tick (spec §4.5).
pub fn announce_many(spectra: Vec<SpectrumInfo>, sink: Arc<dyn ConsumerSink>) -> DataPathMessage {
    let entries = spectra
        .into_iter()
        .map(|spectrum| SpectrumAnnouncement {
            spectrum,
            consumers: vec![sink.clone()],
        })
        .collect();
    DataPathMessage::SignalMsg(SignalMsg::new(entries))
}

/// Opens a `Client` against an autopilot `MockVerbs` and a single-bucket pool
/// sized to `BUFFER_SIZE`.
pub fn open_client(config: Config) -> Client {
    open_client_with(MockVerbs::new_autopilot(), config)
}

/// Opens a `Client` against a caller-configured `MockVerbs` (e.g. scripted to
/// reject, or with overridden device/peer negotiation) and a single-bucket
/// pool sized to `BUFFER_SIZE`.
pub fn open_client_with(verbs: MockVerbs, config: Config) -> Client {
    let pool = HeapBufferPool::new(vec![BUFFER_SIZE], 64);
    Client::open(verbs, pool, config).expect("reactor should start")
}

pub fn new_consumer(capacity: usize) -> (Arc<dyn ConsumerSink>, crossbeam_channel::Receiver<ConsumerMessage>) {
    let (sink, rx) = ChannelConsumer::new(capacity);
    (Arc::new(sink), rx)
}

/// Blocks for up to 2 seconds for the next message; panics on timeout so a
/// hung reactor fails the test loudly instead of hanging CI.
pub fn recv(rx: &crossbeam_channel::Receiver<ConsumerMessage>) -> ConsumerMessage {
    rx.recv_timeout(Duration::from_secs(2))
        .expect("expected a consumer message within the timeout")
}
