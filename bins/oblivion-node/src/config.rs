//! Node configuration

use std::path::Path;

use anyhow::{Context, Result};
use oblivion_core::{BridgeDescriptor, CoreConfig, RelayDescriptor};
use oblivion_net::PeerId;
use serde::{Deserialize, Serialize};

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity
    pub node: IdentityConfig,
    /// Engine configuration
    pub core: CoreConfig,
    /// Builtin bridges and relays
    pub bootstrap: BootstrapConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Full hex peer id; a fresh one is generated when absent
    pub peer_id: Option<String>,
}

/// Bootstrap material shipped with the node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub bridges: Vec<BridgeDescriptor>,
    pub relays: Vec<RelayDescriptor>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Configured identity, if any
    pub fn peer_id(&self) -> Result<Option<PeerId>> {
        match &self.node.peer_id {
            Some(hex) => PeerId::from_hex(hex)
                .map(Some)
                .with_context(|| format!("Invalid peer id '{}'", hex)),
            None => Ok(None),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.peer_id()?;
        self.core
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid engine configuration: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = NodeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.logging.level, "info");
        assert_eq!(parsed.core.listen_addr, config.core.listen_addr);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            [core.circuit]
            min_circuits = 1
            bridges_only = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.core.circuit.min_circuits, 1);
        assert!(parsed.core.circuit.bridges_only);
        assert_eq!(parsed.core.circuit.max_circuits, 16);
        assert!(parsed.bootstrap.bridges.is_empty());
    }

    #[test]
    fn test_bad_peer_id_rejected() {
        let mut config = NodeConfig::default();
        config.node.peer_id = Some("not-hex".into());
        assert!(config.validate().is_err());
    }
}
