use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ClientConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Base configuration used by the bot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BotConfig {
    /// Path to the SQLite database holding the paired device.
    pub database_path: PathBuf,
    /// Directory where received images are saved.
    pub media_dir: PathBuf,
    /// Name announced to contacts after login.
    pub push_name: Option<String>,
    /// Reconnect after the connection drops.
    pub auto_reconnect: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            database_path: "examplestore.db".into(),
            media_dir: "myFolder".into(),
            push_name: None,
            auto_reconnect: true,
        }
    }
}

impl BotConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Override the media directory.
    pub fn with_media_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.media_dir = dir.into();
        self
    }

    pub fn with_push_name(mut self, name: impl Into<String>) -> Self {
        self.push_name = Some(name.into());
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Protocol settings derived from this config.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            push_name: self.push_name.clone(),
            auto_reconnect: self.auto_reconnect,
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_bot() {
        let config = BotConfig::default();
        assert_eq!(config.database_path, PathBuf::from("examplestore.db"));
        assert_eq!(config.media_dir, PathBuf::from("myFolder"));
        assert!(config.auto_reconnect);
    }

    #[test]
    fn builders_override_fields() {
        let config = BotConfig::default()
            .with_media_dir("/tmp/media")
            .with_push_name("Bot")
            .with_auto_reconnect(false);
        assert_eq!(config.media_dir, PathBuf::from("/tmp/media"));

        let client = config.client_config();
        assert_eq!(client.push_name.as_deref(), Some("Bot"));
        assert!(!client.auto_reconnect);
    }

    #[test]
    fn loads_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"media_dir": "images", "push_name": "Shop"}}"#).unwrap();

        let config = BotConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.media_dir, PathBuf::from("images"));
        assert_eq!(config.push_name.as_deref(), Some("Shop"));
        assert_eq!(config.database_path, PathBuf::from("examplestore.db"));
    }

    #[test]
    fn reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            BotConfig::from_json_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            BotConfig::from_json_file("/nonexistent/bot.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
