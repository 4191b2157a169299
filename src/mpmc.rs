//! The reactor's control channel (spec §4.1, §4.7 "Quit Protocol").
//!
//! The teacher's own `mpmc` module is `Rc`-based and confined to a single
//! task; this engine's control channel crosses from the owning
//! [`Client`](crate::client::Client)'s thread into the reactor's dedicated
//! thread (spec §5), so it is rebuilt here on a `crossbeam_channel` paired
//! with an `eventfd(2)` so the reactor can fold it into its single `poll(2)`
//! pollset (spec §4.1) instead of giving it a dedicated blocking receive.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_channel::{Receiver as ChanReceiver, Sender as ChanSender, TryRecvError};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};

struct EventFdHandle(RawFd);

impl Drop for EventFdHandle {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

/// Sending half. Cloneable and `Send`; held by the `Client` and handed back
/// to the reactor itself for `Quit`/`End` loopback (spec §4.7).
#[derive(Clone)]
pub struct Sender<T> {
    tx: ChanSender<T>,
    fd: Arc<EventFdHandle>,
}

impl<T> Sender<T> {
    pub fn send(&self, msg: T) {
        // The control channel is sized generously (see `channel`) and carries
        // only infrequent control traffic; a full channel here indicates a
        // stuck reactor, not back-pressure to respect.
        let _ = self.tx.send(msg);
        let one: u64 = 1;
        let _ = write(self.fd.0, &one.to_ne_bytes());
    }
}

/// Receiving half, owned by the reactor.
pub struct Receiver<T> {
    rx: ChanReceiver<T>,
    fd: Arc<EventFdHandle>,
}

impl<T> Receiver<T> {
    /// The fd folded into the reactor's pollset (spec §4.1, "Why non-blocking
    /// poll": the eventfd variant).
    pub fn fd(&self) -> RawFd {
        self.fd.0
    }

    /// Clears the eventfd counter and drains every message currently queued.
    /// Used by tests that want to inspect a batch of dispatch outcomes at
    /// once; the reactor's own tick uses [`Receiver::try_recv_one`] instead
    /// (spec §4.1 step 5: "pop at most one message... and dispatch").
    pub fn drain(&self) -> Vec<T> {
        let mut buf = [0u8; 8];
        let _ = read(self.fd.0, &mut buf);
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(msg) => out.push(msg),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Pops at most one message (spec §4.1 step 5). Clears the eventfd
    /// counter unconditionally (it accumulates one bump per send, not one per
    /// message outstanding) and, if more messages are still queued after this
    /// pop, re-arms the fd with a single bump so `poll` reports it readable
    /// again next tick instead of going quiet with a backlog still queued.
    pub fn try_recv_one(&self) -> Option<T> {
        let mut buf = [0u8; 8];
        let _ = read(self.fd.0, &mut buf);
        match self.rx.try_recv() {
            Ok(msg) => {
                if !self.rx.is_empty() {
                    let one: u64 = 1;
                    let _ = write(self.fd.0, &one.to_ne_bytes());
                }
                Some(msg)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Creates a bounded control channel shared between a producer thread and the
/// reactor's poll loop.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let fd = eventfd(0, EfdFlags::EFD_NONBLOCK).expect("eventfd creation failed");
    let handle = Arc::new(EventFdHandle(fd));
    (
        Sender {
            tx,
            fd: handle.clone(),
        },
        Receiver { rx, fd: handle },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn send_from_another_thread_is_observed_via_drain() {
        let (tx, rx) = channel::<u32>(8);
        let handle = thread::spawn(move || {
            tx.send(1);
            tx.send(2);
        });
        handle.join().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.drain(), vec![1, 2]);
    }

    #[test]
    fn drain_is_idempotent_when_empty() {
        let (_tx, rx) = channel::<u32>(8);
        assert!(rx.drain().is_empty());
        assert!(rx.drain().is_empty());
    }
}
