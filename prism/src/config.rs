//! Runtime configuration. Every field has a compiled-in default; a TOML file
//! overrides selectively.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port of the reliable channel.
    pub reliable_port: u16,
    /// UDP port the client listens on for scene updates.
    pub downstream_port: u16,
    /// UDP port the server listens on for ACKs.
    pub upstream_port: u16,
    /// Seconds between client keepalives.
    pub keepalive_secs: u64,
    /// Socket read timeout, bounding cancellation latency.
    pub read_timeout_secs: u64,
    /// Capacity of the client's receive staging queue, in bytes.
    pub staging_bytes: usize,
    /// Capacity of the resource store's arena, in bytes.
    pub arena_bytes: usize,
    /// Capacity of the client's vertex staging buffer, in bytes.
    pub vertex_staging_bytes: usize,
    /// Capacity of the client's index staging buffer, in bytes.
    pub index_staging_bytes: usize,
    pub limiter: LimiterConfig,
}

/// Send-rate cap for the server's datagram channel. Inert unless `rate` is
/// set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Bytes per second refilled into the bucket. `None` disables the limiter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Burst allowance in bytes.
    pub capacity: usize,
    /// Refill period in milliseconds.
    pub tick_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            reliable_port: crate::DEFAULT_RELIABLE_PORT,
            downstream_port: crate::DEFAULT_DOWNSTREAM_PORT,
            upstream_port: crate::DEFAULT_UPSTREAM_PORT,
            keepalive_secs: 30,
            read_timeout_secs: 5,
            staging_bytes: 128 * 1024 * 1024,
            arena_bytes: 128 * 1024 * 1024,
            vertex_staging_bytes: 64 * 1024 * 1024,
            index_staging_bytes: 16 * 1024 * 1024,
            limiter: LimiterConfig::default(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> LimiterConfig {
        LimiterConfig {
            rate: None,
            capacity: 64 * 1024,
            tick_ms: 200,
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    #[inline]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Interval after which a silent client is dropped: twice the keepalive
    /// period plus a fixed jitter allowance.
    #[inline]
    pub fn keepalive_deadline(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs * 2 + 2)
    }

    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl LimiterConfig {
    #[inline]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
