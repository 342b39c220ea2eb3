//! Configuration for opening a persona database

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PersonaError, PersonaResult};
use crate::events::DEFAULT_EVENT_CHANNEL_CAPACITY;

/// File name used when only a data directory is given
pub const DEFAULT_DB_FILE: &str = "personadb.redb";

/// Default depth of the service command queue
pub const DEFAULT_SERVICE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersonaDbConfig {
    /// Path of the redb file
    pub path: PathBuf,
    /// Repair inconsistencies after each write instead of failing it
    pub auto_fix: bool,
    /// Buffer of the event broadcast channel
    pub event_channel_capacity: usize,
    /// Buffer of the service command channel
    pub service_queue_capacity: usize,
}

impl Default for PersonaDbConfig {
    fn default() -> Self {
        Self::in_dir(".")
    }
}

impl PersonaDbConfig {
    /// Defaults, with the database file placed in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(DEFAULT_DB_FILE),
            auto_fix: true,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            service_queue_capacity: DEFAULT_SERVICE_QUEUE_CAPACITY,
        }
    }

    /// Load from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> PersonaResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(PersonaError::from)
    }

    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PersonaDbConfig::in_dir("/tmp/data");
        assert_eq!(config.path, PathBuf::from("/tmp/data/personadb.redb"));
        assert!(config.auto_fix);
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.service_queue_capacity, 64);
    }

    #[test]
    fn test_from_json_file_fills_missing_keys() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, r#"{"path": "/var/lib/personas.redb", "auto_fix": false}"#).unwrap();

        let config = PersonaDbConfig::from_json_file(&file).unwrap();
        assert_eq!(config.path, PathBuf::from("/var/lib/personas.redb"));
        assert!(!config.auto_fix);
        assert_eq!(config.service_queue_capacity, DEFAULT_SERVICE_QUEUE_CAPACITY);
    }

    #[test]
    fn test_from_json_file_missing() {
        let dir = TempDir::new().unwrap();
        let result = PersonaDbConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(PersonaError::Io(_))));
    }
}
