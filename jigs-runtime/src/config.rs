use std::fs;
use std::path::Path;

use jigs_core::{JigError, Result};
use serde::{Deserialize, Serialize};

/// Settings of one runtime instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Owner assigned to jigs and classes created outside any method
    pub owner: String,

    /// Label stamped into every ledger record id
    pub network: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            owner: "anonymous".to_string(),
            network: "mock".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load a configuration from a JSON file; missing keys take their default
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| JigError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: RuntimeConfig = serde_json::from_str(&text)
            .map_err(|e| JigError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_owner_string(&self.owner) {
            return Err(JigError::Config(format!("invalid default owner {:?}", self.owner)));
        }
        if self.network.is_empty() {
            return Err(JigError::Config("network must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Whether `owner` is a well-formed owner address
pub(crate) fn is_owner_string(owner: &str) -> bool {
    !owner.is_empty() && owner.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"network": "test"}}"#).unwrap();

        let config = RuntimeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.network, "test");
        assert_eq!(config.owner, RuntimeConfig::default().owner);
    }

    #[test]
    fn test_rejects_bad_owner() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"owner": "not an address"}}"#).unwrap();

        let err = RuntimeConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, JigError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "owner = 1").unwrap();
        let err = RuntimeConfig::from_json_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
