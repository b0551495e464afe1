use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::errors::ConfigError;
use super::logging::LoggingConfig;
use super::upstream::{UpstreamEntry, UpstreamKind};

/// Main configuration structure for Ferrous Forward
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream graph, in declaration order
    #[serde(default)]
    pub upstreams: Vec<UpstreamEntry>,
}

impl Config {
    /// Load configuration from file or use defaults
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. ferrous-forward.toml in current directory
    /// 3. /etc/ferrous-forward/config.toml
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let config = if let Some(path) = path {
            Self::from_file(path)?
        } else if std::path::Path::new("ferrous-forward.toml").exists() {
            Self::from_file("ferrous-forward.toml")?
        } else if std::path::Path::new("/etc/ferrous-forward/config.toml").exists() {
            Self::from_file("/etc/ferrous-forward/config.toml")?
        } else {
            return Err(ConfigError::FileRead(
                "ferrous-forward.toml".to_string(),
                "no configuration file found".to_string(),
            ));
        };

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Structural checks that do not need the dependency graph.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::Validation(
                "No upstreams configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.upstreams {
            if entry.tag.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Upstream of type '{}' has an empty tag",
                    entry.kind.as_str()
                )));
            }
            if !seen.insert(entry.tag.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate upstream tag '{}'",
                    entry.tag
                )));
            }
            Self::validate_entry(entry)?;
        }

        Ok(())
    }

    fn validate_entry(entry: &UpstreamEntry) -> Result<(), ConfigError> {
        if let Some(common) = entry.kind.common() {
            if common.address.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Upstream '{}' has no address",
                    entry.tag
                )));
            }
            if common.query_timeout == 0 || common.connect_timeout == 0 {
                return Err(ConfigError::Validation(format!(
                    "Upstream '{}' timeouts must be greater than 0",
                    entry.tag
                )));
            }
        }

        match &entry.kind {
            UpstreamKind::Random(o) | UpstreamKind::Parallel(o) if o.upstreams.is_empty() => {
                Err(ConfigError::Validation(format!(
                    "Upstream '{}' has no member upstreams",
                    entry.tag
                )))
            }
            UpstreamKind::QueryTest(o) if o.upstreams.is_empty() || o.test_interval == 0 => {
                Err(ConfigError::Validation(format!(
                    "Upstream '{}' needs members and a non-zero test-interval",
                    entry.tag
                )))
            }
            UpstreamKind::Fallback(o) if o.check_interval == 0 => {
                Err(ConfigError::Validation(format!(
                    "Upstream '{}' check-interval must be greater than 0",
                    entry.tag
                )))
            }
            UpstreamKind::Dhcp(o) if o.check_interval == 0 => Err(ConfigError::Validation(
                format!("Upstream '{}' check-interval must be greater than 0", entry.tag),
            )),
            _ => Ok(()),
        }
    }

    pub fn upstream(&self, tag: &str) -> Option<&UpstreamEntry> {
        self.upstreams.iter().find(|e| e.tag == tag)
    }
}
