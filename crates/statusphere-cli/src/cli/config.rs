use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use statusphere_core::CoreConfig;

/// CLI configuration that can be loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    #[serde(flatten)]
    pub core: CoreConfig,

    /// Account used by `send` and `me`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
}

/// Repository owner and a session token for their PDS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub did: String,
    pub access_token: String,
}

impl CliConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Config file if given, otherwise defaults; environment overrides apply
    /// either way.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.core = config.core.apply_env();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_config_with_core_fields() {
        let json = r#"{"dataDir": "/tmp/statusphere", "dbPath": ":memory:", "cursorWriteIntervalSecs": 5}"#;
        let config: CliConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.core.data_dir, PathBuf::from("/tmp/statusphere"));
        assert_eq!(config.core.database_path(), None);
        assert_eq!(config.core.cursor_write_interval_secs, 5);
        assert_eq!(config.core.wanted_collections, vec!["xyz.statusphere.status"]);
        assert!(config.account.is_none());
    }

    #[test]
    fn test_parse_config_with_account() {
        let json = r#"{
            "account": {
                "did": "did:plc:alice",
                "accessToken": "secret"
            }
        }"#;
        let config: CliConfig = serde_json::from_str(json).unwrap();
        let account = config.account.unwrap();
        assert_eq!(account.did, "did:plc:alice");
        assert_eq!(account.access_token, "secret");
    }

    #[test]
    fn test_load_reports_path_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = CliConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("missing.json"));

        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"jetstreamUrl": "wss://jetstream.test/subscribe"}"#).unwrap();
        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.core.jetstream_url, "wss://jetstream.test/subscribe");
    }
}
