//! Agent package inventories.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::storage::PackageCheck;

/// What software an agent can run without installing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "packages")]
pub enum PackageInventory {
    /// Packages are supplied out-of-band (shared software area); every
    /// requirement is considered satisfied.
    SharedFilesystem,
    Installed(BTreeSet<String>),
}

impl PackageInventory {
    /// Parses an agent's package report.
    ///
    /// Entries are separated by commas or whitespace; empty entries are
    /// ignored.
    pub fn parse(raw: Option<&str>, out_of_band: bool) -> Self {
        if out_of_band {
            return PackageInventory::SharedFilesystem;
        }

        let installed = raw
            .unwrap_or_default()
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        PackageInventory::Installed(installed)
    }

    /// The store-side package constraint for this inventory.
    pub fn check(&self) -> PackageCheck {
        match self {
            PackageInventory::SharedFilesystem => PackageCheck::Ignore,
            PackageInventory::Installed(set) => PackageCheck::Installed(set.clone()),
        }
    }

    /// Whether a package-fallback tier can ever apply.
    pub fn constrains(&self) -> bool {
        matches!(self, PackageInventory::Installed(_))
    }

    /// Required packages the agent does not have, in requirement order.
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        match self {
            PackageInventory::SharedFilesystem => Vec::new(),
            PackageInventory::Installed(set) => required
                .iter()
                .filter(|p| !set.contains(*p))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_separators() {
        let inventory = PackageInventory::parse(Some("VO_ALICE@ROOT::v6, VO_ALICE@Geant4::v10\n"), false);
        match &inventory {
            PackageInventory::Installed(set) => {
                assert_eq!(set.len(), 2);
                assert!(set.contains("VO_ALICE@ROOT::v6"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_of_band_satisfies_everything() {
        let inventory = PackageInventory::parse(Some("ignored"), true);
        assert_eq!(inventory, PackageInventory::SharedFilesystem);
        assert!(!inventory.constrains());
        assert_eq!(inventory.check(), PackageCheck::Ignore);
        assert!(inventory.missing(&["A".to_string()]).is_empty());
    }

    #[test]
    fn test_missing_keeps_requirement_order() {
        let inventory = PackageInventory::parse(Some("B"), false);
        let required = vec!["C".to_string(), "B".to_string(), "A".to_string()];
        assert_eq!(inventory.missing(&required), vec!["C".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_no_report_means_nothing_installed() {
        let inventory = PackageInventory::parse(None, false);
        assert_eq!(inventory.missing(&["A".to_string()]), vec!["A".to_string()]);
    }
}
