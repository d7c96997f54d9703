//! Configuration loading and typed config structures for Tickstream.
//!
//! The canonical configuration lives in `tickstream-config.yaml` in the
//! working directory. This module defines strongly-typed structs that
//! mirror the YAML structure, and provides a loader that reads and
//! validates the file. Every field has a default so a partial (or absent)
//! file is valid.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is outside its allowed range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
///
/// Mirrors the structure of `tickstream-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    /// Listener address and stream identity.
    #[serde(default)]
    pub server: ServerSection,

    /// Tick generation settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Snapshot builder settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Scheduler, flow-control and liveness settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl StreamConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `TICKSTREAM_HOST` overrides `server.host`
    /// - `TICKSTREAM_PORT` overrides `server.port`
    /// - `TICKSTREAM_STREAM_ID` overrides `server.stream_id`
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, apply environment
    /// overrides and validate the result.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.server.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults (with
    /// environment overrides still applied).
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let mut config = Self::default();
        config.server.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or divide by zero at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 9] = [
            (self.source.rate_per_sec == 0, "source.rate_per_sec must be at least 1"),
            (self.source.node_capacity == 0, "source.node_capacity must be at least 1"),
            (self.cache.interval_ms == 0, "cache.interval_ms must be at least 1"),
            (self.cache.chunk_items == 0, "cache.chunk_items must be at least 1"),
            (self.cache.weight_unit == 0, "cache.weight_unit must be at least 1"),
            (
                self.scheduler.pass_interval_ms == 0,
                "scheduler.pass_interval_ms must be at least 1",
            ),
            (
                self.scheduler.ping_interval_ms == 0,
                "scheduler.ping_interval_ms must be at least 1",
            ),
            (
                self.scheduler.server_window_cap == 0,
                "scheduler.server_window_cap must be at least 1",
            ),
            (
                self.scheduler.default_send_cap == 0,
                "scheduler.default_send_cap must be at least 1",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::Invalid {
                reason: (*reason).to_owned(),
            }),
            None => Ok(()),
        }
    }
}

/// Listener address and stream identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identifier of the single stream served by this process.
    #[serde(default = "default_stream_id")]
    pub stream_id: String,

    /// Feature tags advertised in `welcome`.
    #[serde(default = "default_features")]
    pub features: Vec<String>,
}

impl ServerSection {
    /// Override listener settings from the environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("TICKSTREAM_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("TICKSTREAM_PORT") {
            self.port = val.parse().map_err(|e| ConfigError::Invalid {
                reason: format!("invalid TICKSTREAM_PORT: {e}"),
            })?;
        }
        if let Ok(val) = std::env::var("TICKSTREAM_STREAM_ID") {
            self.stream_id = val;
        }
        Ok(())
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stream_id: default_stream_id(),
            features: default_features(),
        }
    }
}

/// Tick generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    /// Ticks advanced per second by the driver.
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: u64,

    /// Seed for the synthetic mutator.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of distinct node ids the synthetic mutator cycles through.
    #[serde(default = "default_node_capacity")]
    pub node_capacity: u64,

    /// Stop after this many ticks (0 = unlimited).
    #[serde(default)]
    pub max_ticks: u64,
}

impl SourceConfig {
    /// Period between advances, `max(1, 1000 / rate)` milliseconds.
    pub fn tick_interval(&self) -> Duration {
        tick_interval_for_rate(self.rate_per_sec)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate_per_sec(),
            seed: default_seed(),
            node_capacity: default_node_capacity(),
            max_ticks: 0,
        }
    }
}

/// Snapshot builder settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Milliseconds between snapshot builds.
    #[serde(default = "default_cache_interval_ms")]
    pub interval_ms: u64,

    /// Items serialized between cooperative yields.
    #[serde(default = "default_chunk_items")]
    pub chunk_items: usize,

    /// zstd compression level.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Ticks after which a cached snapshot is no longer usable.
    #[serde(default = "default_staleness_limit")]
    pub staleness_limit: u64,

    /// Compressed size above which snapshots ship as `snapshotLarge`.
    #[serde(default = "default_large_snapshot_threshold")]
    pub large_snapshot_threshold: usize,

    /// Bytes per credit when weighting large snapshots.
    #[serde(default = "default_weight_unit")]
    pub weight_unit: usize,
}

impl CacheConfig {
    /// Build period as a [`Duration`].
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_cache_interval_ms(),
            chunk_items: default_chunk_items(),
            compression_level: default_compression_level(),
            staleness_limit: default_staleness_limit(),
            large_snapshot_threshold: default_large_snapshot_threshold(),
            weight_unit: default_weight_unit(),
        }
    }
}

/// Scheduler, flow-control and liveness settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerConfig {
    /// Milliseconds between scheduler passes.
    #[serde(default = "default_pass_interval_ms")]
    pub pass_interval_ms: u64,

    /// Milliseconds between ping sweeps.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Queue length above which a session is coalesced to a snapshot.
    #[serde(default = "default_queue_ceiling")]
    pub queue_ceiling: usize,

    /// Messages sent per pass for roles without an explicit cap.
    #[serde(default = "default_send_cap")]
    pub default_send_cap: u32,

    /// Per-role overrides of the per-pass send cap.
    #[serde(default = "default_role_send_caps")]
    pub role_send_caps: BTreeMap<String, u32>,

    /// Upper bound on the negotiated credit window.
    #[serde(default = "default_server_window_cap")]
    pub server_window_cap: u32,

    /// Encoded deltas retained for resume replay and snapshot backfill.
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,

    /// Frames buffered between the scheduler and a socket writer.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl SchedulerConfig {
    /// Scheduler pass period.
    pub const fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    /// Ping sweep period.
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Per-pass send cap for a role.
    pub fn send_cap_for(&self, role: &str) -> u32 {
        self.role_send_caps
            .get(role)
            .copied()
            .unwrap_or(self.default_send_cap)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_ms: default_pass_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            queue_ceiling: default_queue_ceiling(),
            default_send_cap: default_send_cap(),
            role_send_caps: default_role_send_caps(),
            server_window_cap: default_server_window_cap(),
            replay_window: default_replay_window(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Period between advances for a rate, `max(1, 1000 / rate)` milliseconds.
pub fn tick_interval_for_rate(rate_per_sec: u64) -> Duration {
    let ms = 1000_u64.checked_div(rate_per_sec).unwrap_or(1000).max(1);
    Duration::from_millis(ms)
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    8080
}

fn default_stream_id() -> String {
    "tickstream".to_owned()
}

fn default_features() -> Vec<String> {
    vec![
        "deltas".to_owned(),
        "snapshots".to_owned(),
        "resume".to_owned(),
    ]
}

const fn default_rate_per_sec() -> u64 {
    100
}

const fn default_seed() -> u64 {
    42
}

const fn default_node_capacity() -> u64 {
    256
}

const fn default_cache_interval_ms() -> u64 {
    500
}

const fn default_chunk_items() -> usize {
    50
}

const fn default_compression_level() -> i32 {
    6
}

const fn default_staleness_limit() -> u64 {
    100
}

const fn default_large_snapshot_threshold() -> usize {
    512 * 1024
}

const fn default_weight_unit() -> usize {
    64 * 1024
}

const fn default_pass_interval_ms() -> u64 {
    20
}

const fn default_ping_interval_ms() -> u64 {
    30_000
}

const fn default_queue_ceiling() -> usize {
    50
}

const fn default_send_cap() -> u32 {
    3
}

fn default_role_send_caps() -> BTreeMap<String, u32> {
    let mut m = BTreeMap::new();
    m.insert("admin".to_owned(), 10);
    m
}

const fn default_server_window_cap() -> u32 {
    1000
}

const fn default_replay_window() -> usize {
    256
}

const fn default_outbound_buffer() -> usize {
    1024
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.interval_ms, 500);
        assert_eq!(config.cache.staleness_limit, 100);
        assert_eq!(config.scheduler.queue_ceiling, 50);
        assert_eq!(config.scheduler.server_window_cap, 1000);
    }

    #[test]
    fn parse_partial_yaml_keeps_defaults() {
        let yaml = r"
source:
  rate_per_sec: 10
cache:
  interval_ms: 250
scheduler:
  queue_ceiling: 20
  role_send_caps:
    admin: 12
    ops: 6
";
        let config: StreamConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.source.rate_per_sec, 10);
        assert_eq!(config.source.seed, 42);
        assert_eq!(config.cache.interval_ms, 250);
        assert_eq!(config.cache.chunk_items, 50);
        assert_eq!(config.scheduler.queue_ceiling, 20);
        assert_eq!(config.scheduler.send_cap_for("ops"), 6);
        assert_eq!(config.scheduler.send_cap_for("viewer"), 3);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let config: StreamConfig = serde_yml::from_str("source:\n  rate_per_sec: 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_per_sec"));
    }

    #[test]
    fn tick_interval_follows_rate() {
        assert_eq!(tick_interval_for_rate(100), Duration::from_millis(10));
        assert_eq!(tick_interval_for_rate(3), Duration::from_millis(333));
        assert_eq!(tick_interval_for_rate(5000), Duration::from_millis(1));
        assert_eq!(tick_interval_for_rate(0), Duration::from_millis(1000));
    }

    #[test]
    fn admin_role_has_a_larger_cap() {
        let config = SchedulerConfig::default();
        assert_eq!(config.send_cap_for("admin"), 10);
        assert_eq!(config.send_cap_for("anonymous"), 3);
    }
}
