use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// One engine build that instances can be launched with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: bool,
    /// Bundled data wads prepended when a request sets `data=on`.
    #[serde(default)]
    pub data: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionCatalog {
    entries: Vec<VersionEntry>,
    default_index: usize,
}

impl VersionCatalog {
    pub fn new(entries: Vec<VersionEntry>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::Catalog("no versions configured".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.to_lowercase()) {
                return Err(ConfigError::Catalog(format!(
                    "duplicate version `{}`",
                    entry.name
                )));
            }
        }

        let defaults: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.default)
            .map(|(i, _)| i)
            .collect();
        let [default_index] = defaults[..] else {
            return Err(ConfigError::Catalog(format!(
                "exactly one version must be marked default, found {}",
                defaults.len()
            )));
        };

        Ok(Self {
            entries,
            default_index,
        })
    }

    pub fn get(&self, name: &str) -> Option<&VersionEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn default_version(&self) -> &VersionEntry {
        &self.entries[self.default_index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, default: bool) -> VersionEntry {
        VersionEntry {
            name: name.to_string(),
            path: PathBuf::from(format!("/opt/{name}/server")),
            description: String::new(),
            default,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_catalog_requires_one_default() {
        let err = VersionCatalog::new(vec![entry("a", false), entry("b", false)]).unwrap_err();
        assert!(matches!(err, ConfigError::Catalog(_)));

        let err = VersionCatalog::new(vec![entry("a", true), entry("b", true)]).unwrap_err();
        assert!(matches!(err, ConfigError::Catalog(_)));
    }

    #[test]
    fn test_catalog_rejects_empty_and_duplicates() {
        assert!(VersionCatalog::new(Vec::new()).is_err());
        assert!(VersionCatalog::new(vec![entry("zan", true), entry("ZAN", false)]).is_err());
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = VersionCatalog::new(vec![entry("zandronum", true), entry("odamex", false)])
            .unwrap();
        assert_eq!(catalog.get("Odamex").unwrap().name, "odamex");
        assert_eq!(catalog.default_version().name, "zandronum");
        assert!(catalog.get("chocolate").is_none());
        assert_eq!(catalog.iter().count(), 2);
    }
}
