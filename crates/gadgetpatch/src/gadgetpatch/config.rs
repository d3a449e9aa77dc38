//! Process-wide settings.
//!
//! Loaded once at startup (defaults, then an optional TOML file, then
//! environment overrides) and handed to sessions explicitly.

use crate::gadgetpatch::error::{PatchError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "GADGETPATCH_CONFIG";
pub const GADGETS_DIR_ENV: &str = "GADGETPATCH_GADGETS_DIR";
pub const TEMP_DIR_ENV: &str = "GADGETPATCH_TEMP_DIR";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Gadget cache, `<gadgets_dir>/<version>/<asset>.so`
    pub gadgets_dir: PathBuf,
    /// Root under which session working directories are created
    pub temp_dir: PathBuf,
    /// Run apktool as `java -jar <jar>` instead of an `apktool` on PATH
    pub apktool_jar: Option<PathBuf>,
    pub device_timeout_secs: u64,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub keystore: KeystoreConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeystoreConfig {
    /// Empty means a fresh keystore per session, kept out of the way of
    /// concurrent runs
    pub path: PathBuf,
    pub alias: String,
    pub password: String,
    pub dname: String,
    pub validity_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub download_base: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        let cache_root = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".cache"))
            .unwrap_or_else(std::env::temp_dir);

        Self {
            gadgets_dir: cache_root.join("gadgetpatch").join("gadgets"),
            temp_dir: std::env::temp_dir().join("gadgetpatch"),
            apktool_jar: None,
            device_timeout_secs: 10,
            fetch_retries: 3,
            retry_backoff_ms: 500,
            keystore: KeystoreConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            alias: "gadgetpatch".to_string(),
            password: "password".to_string(),
            dname: "CN=gadgetpatch, OU=ID, O=gadgetpatch, L=Frida, S=APK, C=BR".to_string(),
            validity_days: 700,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            download_base: "https://github.com/frida/frida/releases/download".to_string(),
            user_agent: concat!("gadgetpatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl KeystoreConfig {
    pub fn is_per_session(&self) -> bool {
        self.path.as_os_str().is_empty()
    }
}

impl Config {
    /// Builds the effective configuration. An explicit `path` wins over
    /// `GADGETPATCH_CONFIG`; directory env vars win over both.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };

        if let Some(dir) = std::env::var_os(GADGETS_DIR_ENV) {
            config.gadgets_dir = PathBuf::from(dir);
        }

        if let Some(dir) = std::env::var_os(TEMP_DIR_ENV) {
            config.temp_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| PatchError::from_io(path, e))?;

        Self::from_toml(&contents).map_err(|e| {
            PatchError::InvalidInput(format!("config file {}: {e}", path.display()))
        })
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
