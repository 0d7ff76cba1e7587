//! Bridge configuration
//!
//! Defaults suit the bundled simplecble artifacts. Values can come from a
//! JSON document and be overridden from the environment:
//!
//! - `BLUEBRIDGE_LIBRARY`: native library base name
//! - `BLUEBRIDGE_NATIVE_DIR`: resource root holding `<arch>/<artifact>`

use crate::loader::NATIVE_DIR_ENV;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LIBRARY_ENV: &str = "BLUEBRIDGE_LIBRARY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base name of the native library, without prefix or extension
    pub library_name: String,
    /// Resource root; falls back to `BLUEBRIDGE_NATIVE_DIR` then `<exe dir>/native`
    pub native_dir: Option<PathBuf>,
    /// Default duration of a timed scan
    pub scan_duration_ms: u64,
    /// How long drivers wait for a connect attempt to settle
    pub connect_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            library_name: "simplecble".to_string(),
            native_dir: None,
            scan_duration_ms: 5_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BridgeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var(LIBRARY_ENV) {
            if !name.trim().is_empty() {
                self.library_name = name.trim().to_string();
            }
        }
        if let Some(dir) = std::env::var_os(NATIVE_DIR_ENV) {
            self.native_dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("cannot serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.library_name.trim();
        if name.is_empty() {
            return Err(Error::InvalidConfig("library_name must not be empty".to_string()));
        }
        if name.contains(|c: char| c == '/' || c == '\\') {
            return Err(Error::InvalidConfig(
                "library_name must be a base name, not a path".to_string(),
            ));
        }
        if self.scan_duration_ms == 0 {
            return Err(Error::InvalidConfig("scan_duration_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
