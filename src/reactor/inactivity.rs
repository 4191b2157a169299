//! Hand-rolled `timerfd(2)` wrapper for the inactivity sweep (spec §4.1 step
//! 3, §4.6). `nix` 0.23 (the version pinned here) has no `timerfd` module, so
//! this goes straight to `libc`, mirroring the original engine's direct
//! `timerfd_create(CLOCK_MONOTONIC, TFD_NONBLOCK)` usage.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::Config;
use crate::connection::Registry;
use crate::error::ErrorSink;
use crate::rdma::Verbs;

use super::cm_events::begin_disconnect;

/// A periodic, non-blocking interval timer polled alongside every other fd
/// in the reactor's pollset.
pub struct Inactivity {
    fd: RawFd,
}

impl Inactivity {
    /// Arms a periodic timer firing at half of `timeout`, so no idle
    /// connection can go more than one extra period past its deadline
    /// before being swept (spec §4.6).
    pub fn new(timeout: Duration) -> io::Result<Inactivity> {
        let period = (timeout / 2).max(Duration::from_millis(1));
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let spec = libc::itimerspec {
            it_interval: to_timespec(period),
            it_value: to_timespec(period),
        };
        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }
        Ok(Inactivity { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Drains the expiration counter so the fd stops reading ready.
    pub fn consume(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }
}

impl Drop for Inactivity {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
    }
}

/// Disconnects every connection idle past `config.inactive_server_timeout()`
/// (spec §4.6).
pub fn sweep<V: Verbs>(registry: &mut Registry, verbs: &mut V, config: &Config, errors: &mut ErrorSink) {
    let timeout = config.inactive_server_timeout();
    let idle: Vec<_> = registry
        .addrs()
        .filter(|addr| registry.get(addr).map(|ctc| ctc.is_idle(timeout)).unwrap_or(false))
        .collect();
    for addr in idle {
        begin_disconnect(registry, verbs, &addr, errors);
    }
}
