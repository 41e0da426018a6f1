//! Site directory: per-site requirement overrides.
//!
//! Production deployments back this with LDAP; `StaticSiteDirectory` reads
//! the same information from a YAML file.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;

/// Requirement overrides a site imposes on every match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRequirements {
    /// Users the site accepts; empty accepts everyone not denied.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub denied_users: Vec<String>,
    /// Partition string, overriding whatever the agent reports.
    #[serde(default)]
    pub partition: Option<String>,
    /// Raw requirement expression, carried for operators.
    #[serde(default)]
    pub requirements: Option<String>,
}

/// Lookup of site-level requirement overrides.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    /// Overrides for `ce` at `site`. Unknown sites get the defaults.
    async fn lookup(&self, ce: &str, site: &str) -> Result<SiteRequirements, DirectoryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SiteEntry {
    site: String,
    /// Absent means the entry covers every CE of the site.
    #[serde(default)]
    ce: Option<String>,
    #[serde(flatten)]
    requirements: SiteRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SiteFile {
    #[serde(default)]
    sites: Vec<SiteEntry>,
}

/// Site directory loaded once from YAML.
///
/// ```yaml
/// sites:
///   - site: CERN
///     denied_users: [mallory]
///     partition: "cpu,highmem"
///   - site: CERN
///     ce: ALICE::CERN::GPU
///     partition: gpu
/// ```
///
/// A CE-specific entry takes precedence over the site-wide entry.
#[derive(Debug, Clone, Default)]
pub struct StaticSiteDirectory {
    entries: Vec<SiteEntry>,
}

impl StaticSiteDirectory {
    /// An empty directory: every site gets the defaults.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, DirectoryError> {
        let file: SiteFile = serde_yaml::from_str(yaml)?;
        Ok(Self { entries: file.sites })
    }

    /// Loads the directory from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::Load` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DirectoryError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let directory = Self::from_yaml(&content).map_err(|e| DirectoryError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            path = %path.display(),
            entries = directory.len(),
            "Loaded site directory"
        );

        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SiteDirectory for StaticSiteDirectory {
    async fn lookup(&self, ce: &str, site: &str) -> Result<SiteRequirements, DirectoryError> {
        let for_site = self.entries.iter().filter(|e| e.site == site);

        let mut site_wide = None;
        for entry in for_site {
            match entry.ce.as_deref() {
                Some(entry_ce) if entry_ce == ce => return Ok(entry.requirements.clone()),
                None if site_wide.is_none() => site_wide = Some(entry),
                _ => {}
            }
        }

        Ok(site_wide
            .map(|e| e.requirements.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
sites:
  - site: CERN
    denied_users: [mallory]
    partition: "cpu,highmem"
  - site: CERN
    ce: ALICE::CERN::GPU
    partition: gpu
    allowed_users: [alice]
"#;

    #[tokio::test]
    async fn test_ce_entry_wins_over_site_entry() {
        let directory = StaticSiteDirectory::from_yaml(YAML).unwrap();

        let gpu = directory.lookup("ALICE::CERN::GPU", "CERN").await.unwrap();
        assert_eq!(gpu.partition.as_deref(), Some("gpu"));
        assert_eq!(gpu.allowed_users, vec!["alice".to_string()]);

        let other = directory.lookup("ALICE::CERN::LCG", "CERN").await.unwrap();
        assert_eq!(other.partition.as_deref(), Some("cpu,highmem"));
        assert_eq!(other.denied_users, vec!["mallory".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_site_gets_defaults() {
        let directory = StaticSiteDirectory::from_yaml(YAML).unwrap();
        let requirements = directory.lookup("X::Y::Z", "Nowhere").await.unwrap();
        assert_eq!(requirements, SiteRequirements::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let directory = StaticSiteDirectory::load(file.path()).unwrap();
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let result = StaticSiteDirectory::load("/nonexistent/sites.yaml");
        assert!(matches!(result, Err(DirectoryError::Load { .. })));
    }
}
