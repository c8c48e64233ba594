//! Bind mount specifications

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// A host directory to bind into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path
    pub source: String,
    /// Path inside the container
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl MountSpec {
    /// The host path with `~` expanded
    pub fn source_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.source).into_owned())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(self.invalid("source is empty"));
        }
        if self.target.trim().is_empty() {
            return Err(self.invalid("target is empty"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::InvalidMount {
            spec: format!("{}:{}", self.source, self.target),
            reason: reason.to_string(),
        }
    }
}

/// Parses `source:target`, `source:target:ro` or `source:target:rw`
impl FromStr for MountSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ConfigError::InvalidMount {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(':').collect();
        let read_only = match parts.len() {
            2 => false,
            3 => match parts[2] {
                "ro" => true,
                "rw" => false,
                other => return Err(invalid(&format!("unknown mode '{}'", other))),
            },
            _ => return Err(invalid("expected source:target[:ro|rw]")),
        };

        let spec = MountSpec {
            source: parts[0].to_string(),
            target: parts[1].to_string(),
            read_only,
        };
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_write() {
        let spec: MountSpec = "/host/data:/data".parse().unwrap();
        assert_eq!(spec.source, "/host/data");
        assert_eq!(spec.target, "/data");
        assert!(!spec.read_only);
    }

    #[test]
    fn test_parse_modes() {
        assert!("/a:/b:ro".parse::<MountSpec>().unwrap().read_only);
        assert!(!"/a:/b:rw".parse::<MountSpec>().unwrap().read_only);
    }

    #[test]
    fn test_source_path_expands_tilde() {
        let spec: MountSpec = "~/results:/results".parse().unwrap();
        let expanded = spec.source_path();
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with("results"));
        assert_eq!(
            expanded,
            PathBuf::from(shellexpand::tilde("~/results").into_owned())
        );

        let absolute: MountSpec = "/host/data:/data".parse().unwrap();
        assert_eq!(absolute.source_path(), PathBuf::from("/host/data"));
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        for bad in ["/only-source", "/a:/b:xx", "/a:/b:ro:extra", ":/b", "/a:"] {
            assert!(
                matches!(bad.parse::<MountSpec>(), Err(ConfigError::InvalidMount { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
