use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

/// Engine settings, fixed for the lifetime of a [`Database`](crate::Database).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page cache capacity in pages.
    pub cache_pages: usize,
    /// How long a transaction waits for a page lock before giving up.
    pub lock_timeout_ms: u64,
    /// Whether newly created heap files carry per-page CRC32 checksums.
    pub verify_checksums: bool,
    /// Number of ended transaction ids remembered to reject a second end.
    pub ended_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_pages: 50,
            lock_timeout_ms: 5000,
            verify_checksums: true,
            ended_history: 1024,
        }
    }
}

impl EngineConfig {
    /// Layers the defaults, the optional config file at `path` (format taken
    /// from its extension) and `HEAPDB_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: Self = builder
            .add_source(Environment::with_prefix("HEAPDB").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_pages == 0 {
            return Err(StorageError::Usage(
                "cache_pages must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_pages, 50);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(config.verify_checksums);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heapdb.toml");
        std::fs::write(&path, "cache_pages = 8\nverify_checksums = false\n").unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(
            config,
            EngineConfig {
                cache_pages: 8,
                verify_checksums: false,
                ..EngineConfig::default()
            }
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heapdb.toml");
        std::fs::write(&path, "cache_pages = 0\n").unwrap();

        assert!(matches!(
            EngineConfig::load(Some(&path)),
            Err(StorageError::Usage(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            EngineConfig::load(Some(&dir.path().join("absent.toml"))),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_cache_pages(3)
            .with_lock_timeout(Duration::from_millis(250));
        assert_eq!(config.cache_pages, 3);
        assert_eq!(config.lock_timeout_ms, 250);
    }

    #[test]
    fn test_lock_timeout_saturates() {
        let config = EngineConfig::default().with_lock_timeout(Duration::MAX);
        assert_eq!(config.lock_timeout_ms, u64::MAX);
        assert_eq!(config.lock_timeout(), Duration::from_millis(u64::MAX));
    }
}
