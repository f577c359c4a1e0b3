//! Server configuration.
//!
//! Every field has a default; `from_env` overrides from `WORKSPACE_SYNC_*`
//! variables. Out-of-range or unparsable values fall back to the default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// WebSocket listener address
    pub ws_bind_addr: String,
    /// Pull-sync HTTP listener address
    pub http_bind_addr: String,
    /// Per-session outbound queue capacity
    pub outbound_buffer: usize,
    /// Coordinator mailbox capacity
    pub mailbox_capacity: usize,
    /// Periodic flush of dirty documents
    pub flush_interval_secs: u64,
    /// Idle time before a coordinator hibernates
    pub hibernate_after_secs: u64,
    /// RocksDB directory (None = in-memory storage)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind_addr: "127.0.0.1:9090".to_string(),
            http_bind_addr: "127.0.0.1:9091".to_string(),
            outbound_buffer: 256,
            mailbox_capacity: 1024,
            flush_interval_secs: 5,
            hibernate_after_secs: 300,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ws_bind_addr: env::var("WORKSPACE_SYNC_WS_BIND").unwrap_or(defaults.ws_bind_addr),
            http_bind_addr: env::var("WORKSPACE_SYNC_HTTP_BIND").unwrap_or(defaults.http_bind_addr),
            outbound_buffer: parse_ranged("WORKSPACE_SYNC_OUTBOUND_BUFFER", 1..=65_536)
                .unwrap_or(defaults.outbound_buffer),
            mailbox_capacity: parse_ranged("WORKSPACE_SYNC_MAILBOX_CAPACITY", 1..=1_048_576)
                .unwrap_or(defaults.mailbox_capacity),
            flush_interval_secs: parse_ranged("WORKSPACE_SYNC_FLUSH_INTERVAL_SECS", 1..=3_600)
                .unwrap_or(defaults.flush_interval_secs),
            hibernate_after_secs: parse_ranged("WORKSPACE_SYNC_HIBERNATE_AFTER_SECS", 1..=86_400)
                .unwrap_or(defaults.hibernate_after_secs),
            storage_path: env::var("WORKSPACE_SYNC_STORAGE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn hibernate_after(&self) -> Duration {
        Duration::from_secs(self.hibernate_after_secs)
    }
}

fn parse_ranged<T>(name: &str, range: std::ops::RangeInclusive<T>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| range.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.ws_bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.hibernate_after(), Duration::from_secs(300));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_ranged_parse_rejects_out_of_range() {
        // Variable names are private to this test.
        env::set_var("WORKSPACE_SYNC_TEST_RANGED_OK", " 42 ");
        env::set_var("WORKSPACE_SYNC_TEST_RANGED_HIGH", "100000");
        env::set_var("WORKSPACE_SYNC_TEST_RANGED_JUNK", "many");

        assert_eq!(parse_ranged::<u64>("WORKSPACE_SYNC_TEST_RANGED_OK", 1..=100), Some(42));
        assert_eq!(parse_ranged::<u64>("WORKSPACE_SYNC_TEST_RANGED_HIGH", 1..=100), None);
        assert_eq!(parse_ranged::<u64>("WORKSPACE_SYNC_TEST_RANGED_JUNK", 1..=100), None);
        assert_eq!(parse_ranged::<u64>("WORKSPACE_SYNC_TEST_RANGED_UNSET", 1..=100), None);
    }
}
