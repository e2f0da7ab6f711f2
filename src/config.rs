//! Runtime configuration loading from environment variables.
//!
//! All values are loaded from `GG_RELAY_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_RELAY_QUEUE_MAX_MESSAGES` | 512 | Max messages per queue |
//! | `GG_RELAY_QUEUE_MAX_BYTES` | 8388608 | Max payload bytes per queue |
//! | `GG_RELAY_WRITE_BATCH_MESSAGES` | 16 | Max messages per written batch |
//! | `GG_RELAY_WRITE_BATCH_BYTES` | 262144 | Max payload bytes per written batch |
//! | `GG_RELAY_DELEGATE_PROGRAM` | (unset) | Delegate executable path |
//! | `GG_RELAY_DELEGATE_ARGS` | (empty) | Whitespace-separated argv |
//! | `GG_RELAY_DELEGATE_ENV` | (empty) | `KEY=VALUE` pairs separated by `;` |

use std::path::PathBuf;
use std::time::Duration;

use crate::delegate::DelegatorConfig;
use crate::queue::QueueConfig;

/// Subprocess launch description, consumed only at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Supplies the delegate launch description. Read-only collaborator; the
/// supervisor consults it on every spawn attempt, so an initially-unset
/// source may become configured later.
pub trait DelegateConfigSource: Send + Sync {
    fn delegate_spec(&self) -> Option<DelegateSpec>;
}

/// Reads the delegate spec from `GG_RELAY_DELEGATE_*` variables.
#[derive(Debug, Default)]
pub struct EnvDelegateSource;

impl DelegateConfigSource for EnvDelegateSource {
    fn delegate_spec(&self) -> Option<DelegateSpec> {
        let program = std::env::var("GG_RELAY_DELEGATE_PROGRAM").ok()?;
        if program.is_empty() {
            return None;
        }
        let args = std::env::var("GG_RELAY_DELEGATE_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let env = std::env::var("GG_RELAY_DELEGATE_ENV")
            .map(|v| parse_env_pairs(&v))
            .unwrap_or_default();
        Some(DelegateSpec { program: PathBuf::from(program), args, env })
    }
}

/// A fixed delegate spec, for embedders and tests.
#[derive(Debug)]
pub struct StaticDelegateSource(pub DelegateSpec);

impl DelegateConfigSource for StaticDelegateSource {
    fn delegate_spec(&self) -> Option<DelegateSpec> {
        Some(self.0.clone())
    }
}

fn parse_env_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load queue limits from the environment.
pub fn load_queue_config() -> QueueConfig {
    let max_count = parse_usize("GG_RELAY_QUEUE_MAX_MESSAGES", 512).max(1);
    let max_bytes = parse_usize("GG_RELAY_QUEUE_MAX_BYTES", 8 * 1024 * 1024).max(1);
    QueueConfig { max_count, max_bytes }
}

/// Load supervisor tunables from the environment. The escalation grace
/// periods and respawn delay are protocol-fixed and stay at their defaults.
pub fn load_delegator_config() -> DelegatorConfig {
    let write_batch_count = parse_usize("GG_RELAY_WRITE_BATCH_MESSAGES", 16).max(1);
    let write_batch_bytes = parse_usize("GG_RELAY_WRITE_BATCH_BYTES", 256 * 1024).max(1);
    DelegatorConfig {
        write_batch_count,
        write_batch_bytes,
        ..DelegatorConfig::default()
    }
}

/// All relay configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub queue: QueueConfig,
    pub delegator: DelegatorConfig,
}

impl EnvConfig {
    pub fn load() -> Self {
        Self { queue: load_queue_config(), delegator: load_delegator_config() }
    }
}

/// Fixed delays used by `DelegatorConfig::default()`.
pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(4);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);
