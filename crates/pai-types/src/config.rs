//! Session configuration.
//!
//! A [`SessionConfig`] is built explicitly and passed to whatever needs it.
//! Values are layered: config file, then `PAI_*` environment variables, then
//! whatever the caller sets on top (CLI flags).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{PaiError, Result};

/// Environment variable naming the config file location.
pub const ENV_CONFIG_PATH: &str = "PAI_CONFIG_PATH";

const ENV_REGION_ID: &str = "PAI_REGION_ID";
const ENV_WORKSPACE_ID: &str = "PAI_WORKSPACE_ID";
const ENV_ENDPOINT: &str = "PAI_ENDPOINT";
const ENV_PROVIDER: &str = "PAI_PROVIDER";
const ENV_ACCESS_TOKEN: &str = "PAI_ACCESS_TOKEN";
const ENV_TIMEOUT_SECS: &str = "PAI_TIMEOUT_SECS";

/// Connection and identity settings for talking to the pipeline service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub region_id: Option<String>,
    pub workspace_id: Option<String>,
    /// Full service endpoint; derived from `region_id` when unset.
    pub endpoint: Option<String>,
    /// Provider recorded in compiled manifest metadata.
    pub provider: Option<String>,
    pub access_token: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl SessionConfig {
    /// `$PAI_CONFIG_PATH` if set, otherwise `~/.pai/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|home| home.join(".pai").join("config.json"))
    }

    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            PaiError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "Loaded session config");
        Ok(config)
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Build a config from `PAI_*` process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a config from an iterator of `(key, value)` pairs using the
    /// `PAI_*` variable names. Unrelated keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let value = value.into();
            match key.as_ref() {
                ENV_REGION_ID => config.region_id = Some(value),
                ENV_WORKSPACE_ID => config.workspace_id = Some(value),
                ENV_ENDPOINT => config.endpoint = Some(value),
                ENV_PROVIDER => config.provider = Some(value),
                ENV_ACCESS_TOKEN => config.access_token = Some(value),
                ENV_TIMEOUT_SECS => {
                    let secs = value.parse().map_err(|_| {
                        PaiError::Config(format!("{ENV_TIMEOUT_SECS} must be an integer, got '{value}'"))
                    })?;
                    config.timeout_secs = Some(secs);
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Overlay `other` on top of `self`: every field set in `other` wins.
    pub fn merge(self, other: SessionConfig) -> Self {
        Self {
            region_id: other.region_id.or(self.region_id),
            workspace_id: other.workspace_id.or(self.workspace_id),
            endpoint: other.endpoint.or(self.endpoint),
            provider: other.provider.or(self.provider),
            access_token: other.access_token.or(self.access_token),
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
        }
    }

    /// Load the config file (explicit path, or the default location if it
    /// exists) and overlay the environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let from_file = match path {
            Some(p) => Self::load(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::load(&p)?,
                _ => Self::default(),
            },
        };
        Ok(from_file.merge(Self::from_env()?))
    }

    /// Service endpoint: explicit `endpoint`, else derived from the region.
    pub fn endpoint(&self) -> Result<String> {
        if let Some(ref endpoint) = self.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        match self.region_id {
            Some(ref region) => Ok(format!("https://paiflow.{region}.aliyuncs.com")),
            None => Err(PaiError::Config(
                "Neither endpoint nor region_id is configured".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = SessionConfig {
            region_id: Some("cn-hangzhou".into()),
            workspace_id: Some("1234".into()),
            provider: Some("pai".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_tolerates_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"region_id": "cn-shanghai"}"#).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.region_id.as_deref(), Some("cn-shanghai"));
        assert!(loaded.workspace_id.is_none());
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "region_id = 1").unwrap();

        let err = SessionConfig::load(&path).unwrap_err();
        assert!(matches!(err, PaiError::Config(_)));
    }

    #[test]
    fn from_vars_reads_pai_keys_only() {
        let config = SessionConfig::from_vars([
            ("PAI_REGION_ID", "cn-beijing"),
            ("PAI_WORKSPACE_ID", "42"),
            ("PAI_TIMEOUT_SECS", "30"),
            ("HOME", "/root"),
        ])
        .unwrap();
        assert_eq!(config.region_id.as_deref(), Some("cn-beijing"));
        assert_eq!(config.workspace_id.as_deref(), Some("42"));
        assert_eq!(config.timeout_secs, Some(30));
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn from_vars_rejects_bad_timeout() {
        let err = SessionConfig::from_vars([("PAI_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("PAI_TIMEOUT_SECS"));
    }

    #[test]
    fn merge_prefers_overlay() {
        let base = SessionConfig {
            region_id: Some("cn-hangzhou".into()),
            workspace_id: Some("1".into()),
            ..Default::default()
        };
        let overlay = SessionConfig {
            workspace_id: Some("2".into()),
            ..Default::default()
        };
        let merged = base.merge(overlay);
        assert_eq!(merged.region_id.as_deref(), Some("cn-hangzhou"));
        assert_eq!(merged.workspace_id.as_deref(), Some("2"));
    }

    #[test]
    fn endpoint_derived_from_region() {
        let config = SessionConfig {
            region_id: Some("cn-shanghai".into()),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint().unwrap(),
            "https://paiflow.cn-shanghai.aliyuncs.com"
        );

        let explicit = SessionConfig {
            endpoint: Some("http://localhost:8080/".into()),
            ..config
        };
        assert_eq!(explicit.endpoint().unwrap(), "http://localhost:8080");

        assert!(SessionConfig::default().endpoint().is_err());
    }
}
