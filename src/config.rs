//! Operator Configuration
//!
//! Naming policy, label contract and reconcile tuning. Values are loaded
//! from an optional YAML file and then overridden by CLI flags / env vars.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Label Contract
// =============================================================================

/// Label keys and values shared with the rest of the cluster tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelConfig {
    /// Label carrying the owning cluster name
    pub cluster: String,
    /// Label carrying the owning instance name (claims and pods)
    pub instance_name: String,
    /// Label carrying the instance role (pods)
    pub instance_role: String,
    /// Label carrying the volume kind (claims)
    pub pvc_role: String,
    /// Role value marking the write-serving instance
    pub primary_role: String,
    /// Role value written on demoted instances
    pub replica_role: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            cluster: "storage.billyronks.io/cluster".to_string(),
            instance_name: "storage.billyronks.io/instanceName".to_string(),
            instance_role: "storage.billyronks.io/instanceRole".to_string(),
            pvc_role: "storage.billyronks.io/pvcRole".to_string(),
            primary_role: "primary".to_string(),
            replica_role: "replica".to_string(),
        }
    }
}

impl LabelConfig {
    /// Label selector matching every object of a cluster
    pub fn cluster_selector(&self, cluster: &str) -> String {
        format!("{}={}", self.cluster, cluster)
    }
}

// =============================================================================
// Naming Policy
// =============================================================================

/// Volume suffixes that determine each claim's expected identity
///
/// An empty suffix keeps the legacy identity: `<instance>` for data and
/// `<instance>-wal` for the write-ahead log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamingPolicy {
    pub data_suffix: String,
    pub wal_suffix: String,
}

/// Suffix used by the legacy WAL claim identity
pub const LEGACY_WAL_SUFFIX: &str = "-wal";

impl NamingPolicy {
    pub fn new(data_suffix: impl Into<String>, wal_suffix: impl Into<String>) -> Self {
        Self {
            data_suffix: data_suffix.into(),
            wal_suffix: wal_suffix.into(),
        }
    }

    /// Effective data suffix
    pub fn data(&self) -> &str {
        &self.data_suffix
    }

    /// Effective WAL suffix
    pub fn wal(&self) -> &str {
        if self.wal_suffix.is_empty() {
            LEGACY_WAL_SUFFIX
        } else {
            &self.wal_suffix
        }
    }

    /// Reject suffixes that would produce invalid or colliding claim names
    pub fn validate(&self) -> Result<()> {
        for (field, suffix) in [("dataSuffix", self.data()), ("walSuffix", self.wal())] {
            if !is_name_fragment(suffix) {
                return Err(Error::Configuration(format!(
                    "{} {:?} must contain only lowercase alphanumerics and '-'",
                    field, suffix
                )));
            }
        }
        if self.data() == self.wal() {
            return Err(Error::Configuration(format!(
                "data and WAL suffixes must differ, both are {:?}",
                self.data()
            )));
        }
        Ok(())
    }
}

fn is_name_fragment(suffix: &str) -> bool {
    suffix.len() <= 63
        && !suffix.ends_with('-')
        && suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Top-level operator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Active naming policy
    pub naming: NamingPolicy,
    /// Label contract
    pub labels: LabelConfig,
    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
    /// Upper bound on waiting for a deleted pod to disappear
    pub pod_deletion_timeout_secs: u64,
    /// Upper bound on retrying pod recreation and policy restores
    pub release_timeout_secs: u64,
    /// Master switch for automatic remapping
    pub auto_remap: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            naming: NamingPolicy::default(),
            labels: LabelConfig::default(),
            reconcile_interval_secs: 30,
            pod_deletion_timeout_secs: 120,
            release_timeout_secs: 300,
            auto_remap: true,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.naming.validate()?;
        if self.reconcile_interval_secs == 0 {
            return Err(Error::Configuration(
                "reconcileIntervalSecs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn pod_deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_deletion_timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_legacy_wal_suffix() {
        let policy = NamingPolicy::default();
        assert_eq!(policy.data(), "");
        assert_eq!(policy.wal(), "-wal");
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_invalid_suffixes_rejected() {
        assert!(NamingPolicy::new("-Data", "-wal2").validate().is_err());
        assert!(NamingPolicy::new("-data-", "-wal2").validate().is_err());
        assert!(NamingPolicy::new("-x", "-x").validate().is_err());
        assert!(NamingPolicy::new("-data2", "-wal2").validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "naming:\n  dataSuffix: -data2\n  walSuffix: -wal2\nreconcileIntervalSecs: 10\nreleaseTimeoutSecs: 45"
        )
        .unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.naming, NamingPolicy::new("-data2", "-wal2"));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(10));
        assert_eq!(config.release_timeout(), Duration::from_secs(45));
        // Unspecified fields fall back to defaults
        assert_eq!(config.labels, LabelConfig::default());
        assert!(config.auto_remap);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = OperatorConfig::from_yaml("reconcileIntervalSecs: 0").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
