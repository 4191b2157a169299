//! Configuration loading for the spectrum reader.
//!
//! Follows the same wire-format dispatch the teacher's `app::config::from_str`
//! uses: JSON if the trimmed body starts with `{`, YAML otherwise. Every field
//! is optional on the wire and resolved against a documented default, matching
//! `ConnectorConfig`/`ServerConfig` in the teacher.

use std::io;
use std::time::Duration;

const DEFAULT_RESOLVE_ADDR_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RESOLVE_ROUTE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RDMA_READ_MAX_POSTED: u32 = 64;
const DEFAULT_RDMA_READ_MIN_ACK_PART: u32 = 4;
const DEFAULT_PRECONNECT_BACKLOG: bool = true;
const DEFAULT_INACTIVE_SERVER_TIMEOUT_SEC: u64 = 60;
const DEFAULT_SIGNAL_MSG_NUM_SPECTRA: usize = 16;

/// Parses a configuration body, dispatching on the leading byte the same way
/// the teacher's `app::config::from_str` does.
pub fn from_str(text: &str) -> io::Result<Config> {
    let wire: WireConfig = {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            serde_yaml::from_str(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        }
    };
    Ok(wire.resolve())
}

/// Configuration as it appears on the wire: every field optional.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct WireConfig {
    pub resolve_addr_timeout_ms: Option<u64>,
    pub resolve_route_timeout_ms: Option<u64>,
    pub rdma_read_max_posted: Option<u32>,
    pub rdma_read_min_ack_part: Option<u32>,
    pub preconnect_backlog: Option<bool>,
    pub inactive_server_timeout_sec: Option<u64>,
    pub signal_msg_num_spectra: Option<usize>,
}

impl WireConfig {
    pub fn resolve(self) -> Config {
        Config {
            resolve_addr_timeout_ms: self
                .resolve_addr_timeout_ms
                .unwrap_or(DEFAULT_RESOLVE_ADDR_TIMEOUT_MS),
            resolve_route_timeout_ms: self
                .resolve_route_timeout_ms
                .unwrap_or(DEFAULT_RESOLVE_ROUTE_TIMEOUT_MS),
            rdma_read_max_posted: self
                .rdma_read_max_posted
                .unwrap_or(DEFAULT_RDMA_READ_MAX_POSTED),
            rdma_read_min_ack_part: self
                .rdma_read_min_ack_part
                .unwrap_or(DEFAULT_RDMA_READ_MIN_ACK_PART),
            preconnect_backlog: self
                .preconnect_backlog
                .unwrap_or(DEFAULT_PRECONNECT_BACKLOG),
            inactive_server_timeout_sec: self
                .inactive_server_timeout_sec
                .unwrap_or(DEFAULT_INACTIVE_SERVER_TIMEOUT_SEC),
            signal_msg_num_spectra: self
                .signal_msg_num_spectra
                .unwrap_or(DEFAULT_SIGNAL_MSG_NUM_SPECTRA),
        }
    }
}

/// Resolved, immutable-after-startup configuration (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub resolve_addr_timeout_ms: u64,
    pub resolve_route_timeout_ms: u64,
    pub rdma_read_max_posted: u32,
    pub rdma_read_min_ack_part: u32,
    pub preconnect_backlog: bool,
    pub inactive_server_timeout_sec: u64,
    pub signal_msg_num_spectra: usize,
}

impl Default for Config {
    fn default() -> Config {
        WireConfig::default().resolve()
    }
}

impl Config {
    pub fn resolve_addr_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_addr_timeout_ms)
    }

    pub fn resolve_route_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_route_timeout_ms)
    }

    pub fn inactive_server_timeout(&self) -> Duration {
        Duration::from_secs(self.inactive_server_timeout_sec)
    }

    /// `min_ack = max_posted / rdma_read_min_ack_part` (spec §3, §4.2).
    pub fn min_ack(&self, max_posted: u32) -> u32 {
        if self.rdma_read_min_ack_part == 0 {
            max_posted
        } else {
            max_posted / self.rdma_read_min_ack_part
        }
    }
}
