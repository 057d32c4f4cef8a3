//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vaultsync_core::CatchUpDeletionRouting;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    /// Keep secrets in process memory instead of the database.
    pub in_memory_secrets: bool,
    pub max_payload_size: usize,
    pub rate_limit_per_minute: u32,
    pub nonce_window_secs: i64,
    pub nonce_retention_secs: i64,
    pub cleanup_interval_secs: u64,
    pub catch_up_deletions: CatchUpDeletionRouting,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8743".to_string(),
            storage_path: PathBuf::from("relay.db"),
            in_memory_secrets: false,
            max_payload_size: 65_536,
            rate_limit_per_minute: 120,
            nonce_window_secs: 300,
            nonce_retention_secs: 600,
            cleanup_interval_secs: 3600,
            catch_up_deletions: CatchUpDeletionRouting::OtherClients,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit_per_minute == 0 {
            anyhow::bail!("rate_limit_per_minute must be positive");
        }
        if self.nonce_retention_secs < self.nonce_window_secs {
            anyhow::bail!("nonce_retention_secs must cover nonce_window_secs");
        }
        if self.cleanup_interval_secs == 0 {
            anyhow::bail!("cleanup_interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.catch_up_deletions, CatchUpDeletionRouting::OtherClients);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
listen_addr = "0.0.0.0:9000"
catch_up_deletions = "requester"
"#,
        );

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.catch_up_deletions, CatchUpDeletionRouting::Requester);
        assert_eq!(config.max_payload_size, 65_536);
        assert_eq!(config.storage_path, PathBuf::from("relay.db"));
    }

    #[test]
    fn test_unknown_routing_is_rejected() {
        let file = write_config(r#"catch_up_deletions = "everyone""#);
        assert!(RelayConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_retention_shorter_than_window_is_rejected() {
        let file = write_config("nonce_window_secs = 300\nnonce_retention_secs = 60\n");
        let err = RelayConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("nonce_retention_secs"));
    }
}
