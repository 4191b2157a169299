//! The client handle (spec §5): owns the control channel into the reactor,
//! spawns it on a dedicated named OS thread, and exposes the readiness gate
//! the reactor signals twice — once after setup, once on exit.
//!
//! Mirrors the teacher's `main.rs` split of `app::configure` (build the
//! pieces) from `thread::Builder::spawn` (run `admin` on its own thread while
//! `proxies` runs on the caller's); here there is only one reactor, so
//! `Client::open` itself plays the role `admin_thread.join()` played there.

use std::io;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::message::{DataPathMessage, QuitToken};
use crate::mpmc;
use crate::rdma::Verbs;
use crate::reactor::Reactor;

const CONTROL_CHANNEL_CAPACITY: usize = 1024;

/// A running reactor plus the means to talk to it (spec §5). Dropping a
/// `Client` does not itself stop the reactor; call [`Client::quit`] (or
/// `quit_and_join`) for an orderly shutdown, matching the explicit `Quit` →
/// `End` protocol (spec §4.7) rather than relying on drop order.
pub struct Client {
    control_tx: mpmc::Sender<DataPathMessage>,
    thread: Option<JoinHandle<()>>,
    exit_rx: std_mpsc::Receiver<()>,
}

impl Client {
    /// Builds the reactor and starts it on a thread named `"spectrum-reader"`
    /// (spec §5, "dedicated OS thread"). Blocks on the readiness gate's first
    /// signal, so the returned `Client` is only handed back once the reactor
    /// has either finished `init` or given up on it (spec §7, "Setup
    /// failures").
    pub fn open<V, P>(verbs: V, pool: P, config: Config) -> io::Result<Client>
    where
        V: Verbs + Send + 'static,
        P: BufferPool + 'static,
    {
        let (control_tx, control_rx) = mpmc::channel(CONTROL_CHANNEL_CAPACITY);
        let loop_tx = control_tx.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<io::Result<()>>();
        let (exit_tx, exit_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("spectrum-reader".into())
            .spawn(move || match Reactor::try_new(verbs, pool, config, control_rx, loop_tx) {
                Ok(reactor) => {
                    let _ = ready_tx.send(Ok(()));
                    reactor.run();
                    let _ = exit_tx.send(());
                }
                Err(e) => {
                    error!("reactor setup failed: {}", e);
                    // Signal the gate anyway so `open` doesn't block forever
                    // (spec §7): there is no reactor to run a degenerate
                    // drain on, since no consumer has been registered yet at
                    // this point in startup.
                    let _ = ready_tx.send(Err(e));
                    let _ = exit_tx.send(());
                }
            })
            .expect("failed to spawn the spectrum-reader thread");

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Client {
                control_tx,
                thread: Some(thread),
                exit_rx,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "reactor thread exited before signaling readiness",
                ))
            }
        }
    }

    /// Sends a message on the control channel (spec §3, "DataPathMessage").
    pub fn send(&self, msg: DataPathMessage) {
        self.control_tx.send(msg);
    }

    /// Initiates phase 1 of the shutdown protocol (spec §4.7).
    pub fn quit(&self) {
        self.control_tx.send(DataPathMessage::Quit(QuitToken::new()));
    }

    /// Blocks until the reactor thread's exit signal fires, then joins it.
    pub fn wait_for_exit(&mut self) {
        let _ = self.exit_rx.recv();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Convenience for the common shutdown sequence: `quit` then block for
    /// exit.
    pub fn quit_and_join(mut self) {
        self.quit();
        self.wait_for_exit();
    }
}
