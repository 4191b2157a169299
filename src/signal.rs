//! The Filter Dispatch and Signal Receiver contracts (spec §1, §3a, §4.5).
//!
//! Neither collaborator is implemented in full here: the reactor trusts that
//! every [`SpectrumAnnouncement`] arriving on its control channel already
//! carries its resolved consumer set, exactly as spec §4.5 describes. This
//! module defines the shapes those upstream systems must produce plus a
//! trivial test/demo helper that attaches every registered consumer to every
//! spectrum.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::consumer::ConsumerSink;
use crate::digest::DigestBytes;

/// One spectrum advertisement within a signal (spec §3, "payload").
#[derive(Clone, Debug)]
pub struct SpectrumInfo {
    pub server_addr: SocketAddr,
    pub data_addr: u64,
    pub num_channels: u32,
    pub per_channel_size: u32,
    pub expected_digest: DigestBytes,
}

impl SpectrumInfo {
    pub fn buffer_size(&self) -> usize {
        self.num_channels as usize * self.per_channel_size as usize
    }
}

/// One spectrum entry plus the consumer set the filter dispatch computed for
/// it (spec §4.5). An empty `consumers` means no registered consumer wants
/// this spectrum (spec §8, property 7).
#[derive(Clone)]
pub struct SpectrumAnnouncement {
    pub spectrum: SpectrumInfo,
    pub consumers: Vec<Arc<dyn ConsumerSink>>,
}

/// A signal message carrying up to `signal_msg_num_spectra` announcements
/// (spec §3, §4.5).
pub struct SignalMsg {
    pub entries: Vec<SpectrumAnnouncement>,
}

impl SignalMsg {
    pub fn new(entries: Vec<SpectrumAnnouncement>) -> SignalMsg {
        SignalMsg { entries }
    }
}

/// A trivial filter dispatch stand-in: attaches every one of `consumers` to
/// every spectrum it is given. Used only by tests and `demos/run_reader.rs`;
/// a real deployment replaces this with the actual per-consumer filter
/// evaluation (out of scope here, spec §1).
pub struct NoopFilterDispatch {
    consumers: Vec<Arc<dyn ConsumerSink>>,
}

impl NoopFilterDispatch {
    pub fn new(consumers: Vec<Arc<dyn ConsumerSink>>) -> NoopFilterDispatch {
        NoopFilterDispatch { consumers }
    }

    pub fn dispatch(&self, spectra: Vec<SpectrumInfo>) -> SignalMsg {
        let entries = spectra
            .into_iter()
            .map(|spectrum| SpectrumAnnouncement {
                spectrum,
                consumers: self.consumers.clone(),
            })
            .collect();
        SignalMsg::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ChannelConsumer;

    #[test]
    fn noop_dispatch_attaches_all_consumers() {
        let (sink, _rx) = ChannelConsumer::new(8);
        let sink: Arc<dyn ConsumerSink> = Arc::new(sink);
        let dispatch = NoopFilterDispatch::new(vec![sink]);
        let spectra = vec![SpectrumInfo {
            server_addr: "127.0.0.1:9000".parse().unwrap(),
            data_addr: 0,
            num_channels: 4,
            per_channel_size: 8,
            expected_digest: [0u8; 16],
        }];
        let msg = dispatch.dispatch(spectra);
        assert_eq!(msg.entries.len(), 1);
        assert_eq!(msg.entries[0].consumers.len(), 1);
    }
}
