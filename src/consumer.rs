//! The Consumer Queues contract (spec §1, §3a, §6).
//!
//! Bounded MPSC queues delivering typed messages to each consumer, with
//! overflow accounting (spec §1). The real consumer-queue layer lives outside
//! this crate's scope; [`ChannelConsumer`] is the reference implementation the
//! reactor is built and tested against, backed by a bounded
//! `crossbeam_channel`.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::message::ConsumerMessage;

/// A single attempt to enqueue a message overflowed the consumer's queue
/// (spec §6, `queue_overflow`).
#[derive(Debug)]
pub struct Overflow;

/// The seam the reactor delivers messages through (spec §4.3 step 6, "push to
/// every consumer in its consumer set").
pub trait ConsumerSink: Send + Sync {
    fn push(&self, msg: ConsumerMessage) -> Result<(), Overflow>;
}

/// A bounded-channel consumer sink. A full channel is accounted as
/// `queue_overflow` rather than blocking the reactor (spec §6).
pub struct ChannelConsumer {
    tx: Sender<ConsumerMessage>,
    overflow_count: std::sync::atomic::AtomicU64,
}

impl ChannelConsumer {
    /// Creates a bounded channel of `capacity` and returns the sink half
    /// (handed to the reactor) along with the receiver half (handed to the
    /// actual consumer).
    pub fn new(capacity: usize) -> (ChannelConsumer, Receiver<ConsumerMessage>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            ChannelConsumer {
                tx,
                overflow_count: std::sync::atomic::AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl ConsumerSink for ChannelConsumer {
    fn push(&self, msg: ConsumerMessage) -> Result<(), Overflow> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflow_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!("consumer queue overflow");
                Err(Overflow)
            }
            Err(TrySendError::Disconnected(_)) => {
                // The consumer dropped its receiver; nothing further to deliver.
                Err(Overflow)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_delivers_until_capacity() {
        let (sink, rx) = ChannelConsumer::new(1);
        assert!(sink.push(ConsumerMessage::DataBufferStarvation).is_ok());
        assert!(sink.push(ConsumerMessage::DataBufferStarvation).is_err());
        assert_eq!(sink.overflow_count(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn push_after_receiver_dropped_is_overflow() {
        let (sink, rx) = ChannelConsumer::new(4);
        drop(rx);
        assert!(sink.push(ConsumerMessage::DataBufferStarvation).is_err());
    }
}
