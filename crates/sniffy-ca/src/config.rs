//! CA configuration loaded from TOML.

use std::num::NonZeroUsize;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CaError;

/// Longest leaf lifetime accepted from configuration.
pub const MAX_LEAF_VALIDITY_DAYS: u32 = 825;
/// Longest root lifetime accepted from configuration.
pub const MAX_ROOT_VALIDITY_YEARS: u32 = 100;

/// Certificate authority settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaConfig {
    /// Directory holding the root certificate and key. Empty or absent means
    /// the default location under the home directory.
    #[serde(default)]
    pub storage_dir: Option<String>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
    #[serde(default = "default_root_validity_years")]
    pub root_validity_years: u32,
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            cache_capacity: default_cache_capacity(),
            leaf_validity_days: default_leaf_validity_days(),
            root_validity_years: default_root_validity_years(),
            key_algorithm: KeyAlgorithm::default(),
        }
    }
}

impl CaConfig {
    /// Reject settings that would produce an unusable CA.
    pub fn validate(&self) -> Result<(), CaError> {
        if self.cache_capacity == 0 {
            return Err(CaError::Config("cache_capacity must be positive".to_string()));
        }
        if !(1..=MAX_LEAF_VALIDITY_DAYS).contains(&self.leaf_validity_days) {
            return Err(CaError::Config(format!(
                "leaf_validity_days must be between 1 and {MAX_LEAF_VALIDITY_DAYS}"
            )));
        }
        if !(1..=MAX_ROOT_VALIDITY_YEARS).contains(&self.root_validity_years) {
            return Err(CaError::Config(format!(
                "root_validity_years must be between 1 and {MAX_ROOT_VALIDITY_YEARS}"
            )));
        }
        Ok(())
    }

    pub(crate) fn capacity(&self) -> Result<NonZeroUsize, CaError> {
        NonZeroUsize::new(self.cache_capacity)
            .ok_or_else(|| CaError::Config("cache_capacity must be positive".to_string()))
    }
}

/// Key type used for both the root and the leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
}

impl KeyAlgorithm {
    pub(crate) fn signature_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

/// Load configuration from the given path. A missing path or file yields
/// the defaults.
pub fn load_config(path: Option<&Path>) -> Result<CaConfig, CaError> {
    let Some(config_path) = path.filter(|p| p.exists()) else {
        info!("no config file found, using defaults");
        return Ok(CaConfig::default());
    };

    let content = std::fs::read_to_string(config_path)
        .map_err(|e| CaError::Config(format!("failed to read config: {e}")))?;
    let config: CaConfig = toml::from_str(&content)
        .map_err(|e| CaError::Config(format!("failed to parse config: {e}")))?;
    config.validate()?;
    info!(path = %config_path.display(), "loaded config");
    Ok(config)
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_leaf_validity_days() -> u32 {
    30
}

fn default_root_validity_years() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = CaConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("cache_capacity = 1024"));
        assert!(toml_str.contains("key_algorithm = \"ecdsa-p256\""));
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
storage_dir = "/var/lib/sniffy"
cache_capacity = 2
key_algorithm = "ecdsa-p384"
"#;
        let config: CaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage_dir.as_deref(), Some("/var/lib/sniffy"));
        assert_eq!(config.cache_capacity, 2);
        assert_eq!(config.leaf_validity_days, 30);
        assert_eq!(config.root_validity_years, 10);
        assert_eq!(config.key_algorithm, KeyAlgorithm::EcdsaP384);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = CaConfig {
            cache_capacity: 0,
            ..CaConfig::default()
        };
        assert!(matches!(config.validate(), Err(CaError::Config(_))));
        assert!(config.capacity().is_err());
    }

    #[test]
    fn oversized_validity_is_rejected() {
        let leaf = CaConfig {
            leaf_validity_days: 4_000_000,
            ..CaConfig::default()
        };
        assert!(matches!(leaf.validate(), Err(CaError::Config(_))));

        let root = CaConfig {
            root_validity_years: MAX_ROOT_VALIDITY_YEARS + 1,
            ..CaConfig::default()
        };
        assert!(matches!(root.validate(), Err(CaError::Config(_))));

        let at_limit = CaConfig {
            leaf_validity_days: MAX_LEAF_VALIDITY_DAYS,
            root_validity_years: MAX_ROOT_VALIDITY_YEARS,
            ..CaConfig::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn oversized_validity_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniffy.toml");
        std::fs::write(&path, "leaf_validity_days = 4000000").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(CaError::Config(_))));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, CaConfig::default());
        assert_eq!(load_config(None).unwrap(), CaConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniffy.toml");
        std::fs::write(&path, "cache_capacity = \"lots\"").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(CaError::Config(_))));
    }

    #[test]
    fn invalid_values_in_file_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniffy.toml");
        std::fs::write(&path, "leaf_validity_days = 0").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(CaError::Config(_))));
    }
}
