//! Engine configuration.

use crate::errors::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration, loadable from YAML. Everything has a default so an
/// empty document (or [`EngineConfig::default`]) gives a working in-memory
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Ledger database path. `None` means in-memory (tests, dry runs).
    pub db_path: Option<PathBuf>,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout_ms: u64,
    /// Bounded capacity of the trace projection cache.
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: 5_000,
            cache_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| LedgerError::Validation(format!("failed to parse engine config: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Validation(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = EngineConfig::from_yaml("{}").unwrap();
        assert!(cfg.db_path.is_none());
        assert_eq!(cfg.busy_timeout_ms, 5_000);
        assert_eq!(cfg.cache_capacity, 64);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = EngineConfig::from_yaml("retry_forever: true").unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn explicit_values_parse() {
        let cfg = EngineConfig::from_yaml("db_path: /tmp/ledger.db\ncache_capacity: 8").unwrap();
        assert_eq!(cfg.db_path.unwrap(), PathBuf::from("/tmp/ledger.db"));
        assert_eq!(cfg.cache_capacity, 8);
    }
}
