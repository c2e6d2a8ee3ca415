//! Project configuration (`Keystone.toml`).
//!
//! Values are layered: serde defaults, then the TOML file, then `KEYSTONE_*` environment
//! variables (nested keys separated by `__`, e.g. `KEYSTONE_VERIFICATION__ENABLED=false`).
//! Command-line overrides are applied by the caller on the loaded value.
//!
//! The deployer's private key is read like any other value (usually `KEYSTONE_PRIVATE_KEY`)
//! but is never written back by [`DeployConfig::save_to_file`].

use std::{
    fmt,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{creation::ConfirmationConfig, verify::VerificationConfig};

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "Keystone.toml";

/// Prefix of the environment variables overriding the configuration.
pub const ENV_PREFIX: &str = "KEYSTONE_";

/// A hex-encoded private key, redacted from debug output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn signer(&self) -> Result<PrivateKeySigner> {
        self.0
            .trim()
            .parse()
            .context("Invalid private key, expected 32 hex-encoded bytes")
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Network name, used for the ledger file and verification.
    pub network: String,
    /// Expected chain id. When set, the node's `eth_chainId` must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub rpc_url: Url,
    /// Deployer account. Defaults to the private key's account, then to the first account
    /// unlocked on the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployer: Option<Address>,
    /// Signs creation transactions locally when set.
    #[serde(default, skip_serializing)]
    pub private_key: Option<PrivateKey>,
    /// Hardhat artifacts directory.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    /// Directory holding one ledger per network.
    #[serde(default = "default_deployments_dir")]
    pub deployments_dir: PathBuf,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_deployments_dir() -> PathBuf {
    PathBuf::from("deployments")
}

impl DeployConfig {
    pub fn new(network: impl Into<String>, rpc_url: Url) -> Self {
        Self {
            network: network.into(),
            chain_id: None,
            rpc_url,
            deployer: None,
            private_key: None,
            artifacts_dir: default_artifacts_dir(),
            deployments_dir: default_deployments_dir(),
            confirmation: ConfirmationConfig::default(),
            verification: VerificationConfig::default(),
        }
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn deployer(mut self, deployer: Address) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    /// The local signer, when a private key is configured.
    pub fn signer(&self) -> Result<Option<PrivateKeySigner>> {
        self.private_key.as_ref().map(PrivateKey::signer).transpose()
    }

    /// Load the configuration from `path` (a file, or a directory holding `Keystone.toml`),
    /// layered over the defaults and under `KEYSTONE_*` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {} (run `keystone init` to create one)",
                config_path.display()
            );
        }

        let config: Self = Figment::new()
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        tracing::info!(
            path = %config_path.display(),
            network = %config.network,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse a configuration from TOML text, over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .context("Failed to parse config as TOML")
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(&self, root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;
    use tempdir::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = DeployConfig::from_toml_str(
            r#"
            network = "sepolia"
            chain_id = 11155111
            rpc_url = "https://ethereum-sepolia-rpc.publicnode.com"

            [verification]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.network, "sepolia");
        assert_eq!(config.chain_id, Some(11155111));
        assert_eq!(config.deployer, None);
        assert_eq!(config.artifacts_dir, PathBuf::from("artifacts"));
        assert_eq!(config.confirmation, ConfirmationConfig::default());
        assert_eq!(config.verification.max_attempts, 5);
        assert_eq!(config.verification.initial_delay_secs, 10);
        assert_eq!(config.verification.retry_delay_secs, 5);
        assert!(config.verification.enabled);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
        let config = DeployConfig::new("sepolia", Url::parse("http://localhost:8545").unwrap())
            .chain_id(11155111)
            .deployer(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));

        config
            .save_to_file(&temp_dir.path().join(CONFIG_FILENAME))
            .expect("Failed to save config");

        // Loading from the directory finds Keystone.toml.
        let loaded = DeployConfig::load(temp_dir.path()).expect("Failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_private_key_is_read_but_never_saved() {
        let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
        let config = DeployConfig::from_toml_str(
            r#"
            network = "sepolia"
            rpc_url = "https://ethereum-sepolia-rpc.publicnode.com"
            private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            "#,
        )
        .unwrap();

        let signer = config.signer().unwrap().expect("signer configured");
        assert_eq!(
            signer.address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert!(!format!("{config:?}").contains("ac0974bec39a"));

        let path = temp_dir.path().join(CONFIG_FILENAME);
        config.save_to_file(&path).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(!saved.contains("private_key"), "{saved}");
    }

    #[test]
    fn test_invalid_private_key() {
        let config = DeployConfig::new("sepolia", Url::parse("http://localhost:8545").unwrap())
            .private_key(PrivateKey::new("0x1234"));
        assert!(config.signer().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new("keystone-test").expect("Failed to create temp dir");
        assert!(DeployConfig::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_rejects_malformed_rpc_url() {
        let result = DeployConfig::from_toml_str(
            r#"
            network = "sepolia"
            rpc_url = "not a url"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_relative_paths() {
        let config = DeployConfig::new("localhost", Url::parse("http://127.0.0.1:8545").unwrap());
        assert_eq!(
            config.resolve(Path::new("/project"), &config.deployments_dir),
            PathBuf::from("/project/deployments")
        );
        assert_eq!(
            config.resolve(Path::new("/project"), Path::new("/abs/artifacts")),
            PathBuf::from("/abs/artifacts")
        );
    }
}
