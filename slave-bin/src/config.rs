//! This module maintains the slave's configuration.
//!

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use sandbox::{MemorySize, RuntimeConfig};

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        IoError(::std::io::Error);
        JsonError(::serde_json::Error);
    }
}

/// Configuration of a slave process. Every field has a default; a JSON
/// configuration file passed on the command line overrides them.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlaveConfig {
    /// How long the slave waits for a submission before giving up.
    pub idle_timeout_ms: u64,

    /// Wall-clock budget of a single check invocation.
    pub check_timeout_ms: u64,

    /// How long `stop` may spend flushing queued messages.
    pub flush_timeout_ms: u64,

    /// Upper bound on the linear memory of one invocation, in megabytes.
    pub max_memory_mb: usize,

    /// Upper bound on the captured output of one invocation, in kilobytes.
    pub max_output_kb: usize,

    /// Directory the per-slave log file is created in.
    pub log_dir: PathBuf,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        SlaveConfig {
            idle_timeout_ms: 30_000,
            check_timeout_ms: 10_000,
            flush_timeout_ms: 2_000,
            max_memory_mb: 256,
            max_output_kb: 1024,
            log_dir: PathBuf::from("."),
        }
    }
}

impl SlaveConfig {
    /// Load configuration from the specified JSON file.
    pub fn from_file<P: AsRef<Path>>(config_file: P) -> Result<SlaveConfig> {
        let content = std::fs::read_to_string(config_file.as_ref())?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Derive the isolation runtime configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_memory: MemorySize::MegaBytes(self.max_memory_mb),
            max_output: self.max_output_kb * 1024,
            ..RuntimeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_slave_config_json() {
        let json = r#"
            {
                "idleTimeoutMs": 500,
                "checkTimeoutMs": 2000,
                "logDir": "/var/log/codetester"
            }
        "#;
        let config: SlaveConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.check_timeout_ms, 2000);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/codetester"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.flush_timeout_ms, 2000);
        assert_eq!(config.max_memory_mb, 256);
    }

    #[test]
    fn default_matches_the_specified_timeouts() {
        let config = SlaveConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.check_timeout(), Duration::from_secs(10));
        assert_eq!(config.flush_timeout(), Duration::from_secs(2));
    }
}
