//! Dispatcher configuration loader.
//!
//! The configuration is a single JSON document. Parsing is strict (unknown
//! fields are rejected) and validation is total: every enumeration is checked
//! against its closed set and every numeric range is checked, so the rest of
//! the process can treat the snapshot as trusted and immutable.
//!
//! ## JSON shape
//!
//! ```json
//! {
//!   "type": "raster",
//!   "address": "0.0.0.0:8000",
//!   "timeout_worker_response": 30,
//!   "timeout_pull_job": 10,
//!   "thread_workers": 4,
//!   "processes_workers": 4,
//!   "blocking_threads": 16,
//!   "reload_time": "03:30:00",
//!   "reload_periodicity_days": 1,
//!   "reload_repeat_minutes": 2,
//!   "reload_repeat_attempts": 5,
//!   "max_concurrent_tile_requests": 128,
//!   "log_level": "info"
//! }
//! ```
//!
//! `address` present makes the node a master; absent makes it a worker node.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fmt, fs, path::Path, time::Duration};

/// A configuration violation, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
	pub field: String,
	pub reason: String,
}

impl ConfigError {
	fn new(field: &str, reason: impl Into<String>) -> ConfigError {
		ConfigError {
			field: field.to_string(),
			reason: reason.into(),
		}
	}
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "invalid config field '{}': {}", self.field, self.reason)
	}
}

impl std::error::Error for ConfigError {}

/// Which generator runtime the worker pool spawns.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
	#[default]
	Raster,
	Vector,
}

impl BackendKind {
	/// The generator executable, expected on `PATH`.
	pub fn command(&self) -> &'static str {
		match self {
			BackendKind::Raster => "tilehub-raster-backend",
			BackendKind::Vector => "tilehub-vector-backend",
		}
	}
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace,
}

impl LogLevel {
	pub fn as_filter(&self) -> log::LevelFilter {
		match self {
			LogLevel::Error => log::LevelFilter::Error,
			LogLevel::Warn => log::LevelFilter::Warn,
			LogLevel::Info => log::LevelFilter::Info,
			LogLevel::Debug => log::LevelFilter::Debug,
			LogLevel::Trace => log::LevelFilter::Trace,
		}
	}
}

/// The validated, immutable dispatcher configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
	/// Generator runtime spawned into worker slots.
	#[serde(rename = "type", default)]
	pub backend: BackendKind,

	/// Public bind address. Present: this node is a master. Absent: a worker
	/// node (which binds [`DispatcherConfig::DEFAULT_WORKER_ADDRESS`]).
	#[serde(default)]
	pub address: Option<String>,

	/// Per-request budget against a worker or remote node, in seconds.
	#[serde(default = "default_timeout_worker_response")]
	pub timeout_worker_response: u64,

	/// Queue poll interval, in seconds.
	#[serde(default = "default_timeout_pull_job")]
	pub timeout_pull_job: u64,

	/// Threads of the async runtime.
	#[serde(default = "default_thread_workers")]
	pub thread_workers: usize,

	/// Generator child processes owned by the worker pool.
	#[serde(default = "default_processes_workers")]
	pub processes_workers: usize,

	/// Threads reserved for blocking work (disk scans, SQLite reads).
	#[serde(default = "default_blocking_threads")]
	pub blocking_threads: usize,

	/// Wall-clock time of the scheduled rolling reload, "HH:MM:SS".
	#[serde(default)]
	pub reload_time: Option<String>,

	/// Days between scheduled rolling reloads.
	#[serde(default = "default_reload_periodicity_days")]
	pub reload_periodicity_days: u32,

	/// Minutes one drain attempt may take during a rolling reload.
	#[serde(default = "default_reload_repeat_minutes")]
	pub reload_repeat_minutes: u64,

	/// Drain attempts per worker before its reload is aborted.
	#[serde(default = "default_reload_repeat_attempts")]
	pub reload_repeat_attempts: u32,

	/// Admission gate ceiling for concurrent generation requests.
	#[serde(default = "default_max_concurrent_tile_requests")]
	pub max_concurrent_tile_requests: usize,

	#[serde(default)]
	pub log_level: LogLevel,
}

fn default_timeout_worker_response() -> u64 {
	30
}
fn default_timeout_pull_job() -> u64 {
	10
}
fn default_thread_workers() -> usize {
	num_cpus::get()
}
fn default_processes_workers() -> usize {
	2
}
fn default_blocking_threads() -> usize {
	16
}
fn default_reload_periodicity_days() -> u32 {
	1
}
fn default_reload_repeat_minutes() -> u64 {
	2
}
fn default_reload_repeat_attempts() -> u32 {
	5
}
fn default_max_concurrent_tile_requests() -> usize {
	128
}

impl Default for DispatcherConfig {
	fn default() -> DispatcherConfig {
		serde_json::from_str("{}").expect("empty config is valid")
	}
}

impl DispatcherConfig {
	/// Bind address of a node started without `address`.
	pub const DEFAULT_WORKER_ADDRESS: &'static str = "0.0.0.0:8080";

	/// Parse a JSON config from a string and validate it.
	pub fn from_string(text: &str) -> Result<DispatcherConfig> {
		let config: DispatcherConfig = serde_json::from_str(text).context("parsing dispatcher config (JSON)")?;
		config.validate()?;
		Ok(config)
	}

	/// Parse from a file path and validate.
	pub fn from_path(path: &Path) -> Result<DispatcherConfig> {
		let text = fs::read_to_string(path).with_context(|| format!("reading config file '{}'", path.display()))?;
		DispatcherConfig::from_string(&text)
	}

	/// Check all numeric ranges and formats. Enumerations are already closed
	/// by their types.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.timeout_worker_response == 0 {
			return Err(ConfigError::new("timeout_worker_response", "must be >= 1 second"));
		}
		if self.timeout_pull_job == 0 {
			return Err(ConfigError::new("timeout_pull_job", "must be >= 1 second"));
		}
		if self.thread_workers == 0 {
			return Err(ConfigError::new("thread_workers", "must be >= 1"));
		}
		if self.processes_workers == 0 {
			return Err(ConfigError::new("processes_workers", "must be >= 1"));
		}
		if self.blocking_threads == 0 {
			return Err(ConfigError::new("blocking_threads", "must be >= 1"));
		}
		if self.reload_periodicity_days == 0 {
			return Err(ConfigError::new("reload_periodicity_days", "must be >= 1"));
		}
		if self.reload_repeat_minutes == 0 {
			return Err(ConfigError::new("reload_repeat_minutes", "must be >= 1"));
		}
		if self.reload_repeat_attempts == 0 {
			return Err(ConfigError::new("reload_repeat_attempts", "must be >= 1"));
		}
		if self.max_concurrent_tile_requests == 0 {
			return Err(ConfigError::new("max_concurrent_tile_requests", "must be >= 1"));
		}
		if let Some(address) = &self.address {
			if address.rsplit_once(':').and_then(|(_, port)| port.parse::<u16>().ok()).is_none() {
				return Err(ConfigError::new("address", "expected HOST:PORT"));
			}
		}
		if let Some(raw) = &self.reload_time {
			parse_reload_time(raw).ok_or_else(|| ConfigError::new("reload_time", "expected HH:MM:SS"))?;
		}
		Ok(())
	}

	/// Whether this node is the public entry point.
	pub fn is_master(&self) -> bool {
		self.address.is_some()
	}

	pub fn bind_address(&self) -> &str {
		self.address.as_deref().unwrap_or(Self::DEFAULT_WORKER_ADDRESS)
	}

	pub fn worker_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_worker_response)
	}

	pub fn pull_job_interval(&self) -> Duration {
		Duration::from_secs(self.timeout_pull_job)
	}

	/// Total drain budget of one worker during a rolling reload.
	pub fn reload_drain_budget(&self) -> Duration {
		Duration::from_secs(self.reload_repeat_minutes * 60 * self.reload_repeat_attempts as u64)
	}

	/// Parsed `reload_time`, already validated.
	pub fn reload_time_parts(&self) -> Option<(u8, u8, u8)> {
		self.reload_time.as_deref().and_then(parse_reload_time)
	}
}

fn parse_reload_time(raw: &str) -> Option<(u8, u8, u8)> {
	let mut parts = raw.split(':');
	let hours: u8 = parts.next()?.parse().ok()?;
	let minutes: u8 = parts.next()?.parse().ok()?;
	let seconds: u8 = parts.next()?.parse().ok()?;
	if parts.next().is_some() || hours > 23 || minutes > 59 || seconds > 59 {
		return None;
	}
	Some((hours, minutes, seconds))
}
