use std::fmt::Debug;

use anyhow::{anyhow, Result};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::JournalConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub instance_id: Option<String>,
    pub structured_logging: bool,
    pub journal: JournalConfig,
    pub subscriber: SubscriberConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: "local".to_string(),
            instance_id: None,
            structured_logging: false,
            journal: JournalConfig::default(),
            subscriber: SubscriberConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, std::process::id()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.journal.path.as_os_str().is_empty() {
            return Err(anyhow!("journal path must not be empty"));
        }
        if self.subscriber.default_capacity == 0 {
            return Err(anyhow!("subscriber default_capacity must be at least 1"));
        }
        if self.subscriber.backlog_capacity == 0 {
            return Err(anyhow!("subscriber backlog_capacity must be at least 1"));
        }
        if self.subscriber.sweep_interval_ms == 0 {
            return Err(anyhow!("subscriber sweep_interval_ms must be at least 1"));
        }
        if self.subscriber.max_frame_bytes <= buffer_server::frame::PAYLOAD_HEADER_LEN {
            return Err(anyhow!(
                "subscriber max_frame_bytes must exceed the {} byte frame header",
                buffer_server::frame::PAYLOAD_HEADER_LEN
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Capacity of reservoirs acquired by the `subscribe` command.
    pub default_capacity: usize,
    /// Tuples parked before any reservoir exists before reads are suspended.
    pub backlog_capacity: usize,
    pub sweep_interval_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig {
            default_capacity: 1024,
            backlog_capacity: 1024,
            sweep_interval_ms: 10,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use state_store::JournalBackend;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_path_fills_defaults() {
        let file = write_config(
            r#"
env: staging
journal:
  backend: rocksdb
  path: /var/lib/streamgrid/journal
subscriber:
  default_capacity: 3
"#,
        );
        let config = ServerConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.env, "staging");
        assert_eq!(config.journal.backend, JournalBackend::RocksDb);
        assert!(config.journal.sync_on_append);
        assert_eq!(config.subscriber.default_capacity, 3);
        assert_eq!(config.subscriber.sweep_interval_ms, 10);
        assert!(!config.telemetry.enable_tracing);
    }

    #[test]
    fn test_from_path_rejects_invalid_values() {
        for contents in [
            "subscriber:\n  default_capacity: 0\n",
            "subscriber:\n  sweep_interval_ms: 0\n",
            "subscriber:\n  max_frame_bytes: 5\n",
            "journal:\n  path: \"\"\n",
            "journal:\n  backend: s3\n",
        ] {
            let file = write_config(contents);
            assert!(
                ServerConfig::from_path(file.path().to_str().unwrap()).is_err(),
                "accepted {contents:?}"
            );
        }
    }
}
