//! Client configuration stored at `<dir>/dsvn-client.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dsvn_core::{Result, SvnError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Attempts made to take the sync lock before giving up.
    pub lock_attempts: u32,
    /// Pause between lock attempts, in milliseconds.
    pub lock_retry_delay_ms: u64,
    /// Sleep after a commit so later file writes get a newer timestamp.
    pub sleep_for_timestamps: bool,
    /// Idle sessions older than this are dropped by the pool sweeper.
    pub pool_idle_timeout_secs: u64,
    /// Host part of the sync lock token; the machine's hostname when unset.
    pub hostname: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lock_attempts: 10,
            lock_retry_delay_ms: 1000,
            sleep_for_timestamps: true,
            pool_idle_timeout_secs: 60,
            hostname: None,
        }
    }
}

impl ClientConfig {
    pub const FILE_NAME: &'static str = "dsvn-client.json";

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(Self::FILE_NAME)
    }

    /// Load the config from `dir`, or the defaults when there is none.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&data)?;
        if config.lock_attempts == 0 {
            return Err(SvnError::IllegalState(format!(
                "{}: lock_attempts must be at least 1",
                path.display()
            )));
        }
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::path(dir);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = ClientConfig::load(tmp.path()).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.lock_attempts, 10);
        assert_eq!(config.lock_retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = ClientConfig {
            lock_attempts: 3,
            hostname: Some("mirror-1".into()),
            ..ClientConfig::default()
        };
        config.save(tmp.path()).unwrap();
        assert!(!tmp.path().join("dsvn-client.tmp").exists());
        assert_eq!(ClientConfig::load(tmp.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(ClientConfig::path(tmp.path()), r#"{"sleep_for_timestamps": false}"#).unwrap();
        let config = ClientConfig::load(tmp.path()).unwrap();
        assert!(!config.sleep_for_timestamps);
        assert_eq!(config.pool_idle_timeout_secs, 60);
    }

    #[test]
    fn test_zero_lock_attempts_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::write(ClientConfig::path(tmp.path()), r#"{"lock_attempts": 0}"#).unwrap();
        let err = ClientConfig::load(tmp.path()).unwrap_err();
        assert!(matches!(err, SvnError::IllegalState(_)));
        assert!(err.to_string().contains("lock_attempts must be at least 1"));
    }
}
