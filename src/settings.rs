//! Client settings file.
//!
//! `ClientConfig` can be tuned from a JSON file (camelCase keys). Missing
//! keys take their defaults, and a missing or empty file yields the default
//! configuration. The loader never writes the file back.

use std::fs;
use std::path::{Path, PathBuf};

use crate::bpio::{BpioError, BpioResult, ClientConfig};

/// Settings file name inside a configuration directory.
const SETTINGS_FILENAME: &str = "bpio_client.json";

/// Loads client settings from disk.
pub struct ConfigLoader {
    settings_file_path: PathBuf,
}

impl ConfigLoader {
    /// Loader for the settings file inside `config_dir`.
    pub fn new(config_dir: &Path) -> Self {
        Self::from_file(config_dir.join(SETTINGS_FILENAME))
    }

    /// Loader for an explicit settings file path.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            settings_file_path: path.into(),
        }
    }

    /// Load and validate settings, returning defaults if the file doesn't exist.
    pub fn load(&self) -> BpioResult<ClientConfig> {
        if !self.settings_file_path.exists() {
            log::debug!(
                "No settings file at {}, using defaults",
                self.settings_file_path.display()
            );
            return Ok(ClientConfig::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)
            .map_err(|e| self.error(format!("read failed: {}", e)))?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(ClientConfig::default());
        }

        let config: ClientConfig = serde_json::from_str(&contents)
            .map_err(|e| self.error(format!("invalid JSON: {}", e)))?;
        config
            .validate()
            .map_err(|e| self.error(e.to_string()))?;

        log::info!("Loaded settings from {}", self.settings_file_path.display());
        Ok(config)
    }

    /// Get the path where settings are read from.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }

    fn error(&self, reason: String) -> BpioError {
        BpioError::Settings {
            path: self.settings_file_path.display().to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpio::ErrorKind;
    use crate::test_helpers::TestContext;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path());

        assert_eq!(loader.load().unwrap(), ClientConfig::default());
        assert!(loader.settings_path().ends_with(SETTINGS_FILENAME));
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let ctx = TestContext::new();
        let path = ctx.create_file(SETTINGS_FILENAME, "  \n");

        let loaded = ConfigLoader::from_file(path).load().unwrap();
        assert_eq!(loaded, ClientConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let ctx = TestContext::new();
        ctx.create_file(
            SETTINGS_FILENAME,
            r#"{ "exchangeTimeoutMs": 250, "readChunkSize": 4096 }"#,
        );

        let loaded = ConfigLoader::new(ctx.root()).load().unwrap();
        assert_eq!(loaded.exchange_timeout_ms, 250);
        assert_eq!(loaded.read_chunk_size, 4096);
        assert_eq!(loaded.retry_limit, ClientConfig::default().retry_limit);
        assert_eq!(loaded.baud_rate, ClientConfig::default().baud_rate);
    }

    #[test]
    fn test_invalid_json_is_settings_error() {
        let ctx = TestContext::new();
        let path = ctx.create_file(SETTINGS_FILENAME, "{ not json");

        let err = ConfigLoader::from_file(&path).load().unwrap_err();
        assert!(matches!(err, BpioError::Settings { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(err.error_code(), "BPIO-061");
        assert!(err.to_string().contains(SETTINGS_FILENAME));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let ctx = TestContext::new();
        ctx.create_file(SETTINGS_FILENAME, r#"{ "writeChunkSize": 8192 }"#);

        let err = ConfigLoader::new(ctx.root()).load().unwrap_err();
        assert!(matches!(err, BpioError::Settings { .. }));
        assert!(err.to_string().contains("chunk size"));
    }

    #[test]
    fn test_loader_never_writes() {
        let ctx = TestContext::new();
        let contents = r#"{"retryLimit":1}"#;
        ctx.create_file(SETTINGS_FILENAME, contents);

        let loaded = ConfigLoader::new(ctx.root()).load().unwrap();
        assert_eq!(loaded.retry_limit, 1);
        assert_eq!(ctx.read_file(SETTINGS_FILENAME), contents);
    }
}
