//! Local gadget cache in front of a [`GadgetSource`].
//!
//! Cache layout: `<cache_dir>/<version>/frida-gadget-<version>-android-<arch>.so`.
//! A file only ever appears at its final path through a rename, after it was
//! decompressed and checked, so anything found there is trusted.

use crate::gadgetpatch::arch::Architecture;
use crate::gadgetpatch::config::Config;
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::gadget::{
    GadgetAsset, GadgetSource, VersionRequest, asset_file_name, normalize_version, verify_gadget,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct GadgetResolver<S> {
    source: S,
    cache_dir: PathBuf,
    retries: u32,
    backoff: Duration,
    in_flight: Mutex<HashMap<(String, Architecture), KeyLock>>,
}

impl<S: GadgetSource> GadgetResolver<S> {
    pub fn new(source: S, cache_dir: PathBuf) -> Self {
        Self {
            source,
            cache_dir,
            retries: 3,
            backoff: Duration::from_millis(500),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(source: S, config: &Config) -> Self {
        Self::new(source, config.gadgets_dir.clone())
            .with_retries(config.fetch_retries, config.retry_backoff())
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache_path(&self, version: &str, architecture: Architecture) -> PathBuf {
        self.cache_dir
            .join(version)
            .join(asset_file_name(version, architecture))
    }

    pub async fn resolve_version(&self, request: &VersionRequest) -> Result<String> {
        let version = match request {
            VersionRequest::Exact(version) => version.clone(),
            VersionRequest::Latest => self.source.latest_version().await?,
        };
        checked_version(&version)
    }

    /// Returns the cached gadget, downloading it first on a miss.
    ///
    /// Concurrent calls for the same key share one download; calls for
    /// different keys proceed independently.
    pub async fn resolve(&self, version: &str, architecture: Architecture) -> Result<GadgetAsset> {
        let version = &checked_version(version)?;
        let path = self.cache_path(version, architecture);
        let asset = GadgetAsset {
            version: version.to_string(),
            architecture,
            path: path.clone(),
        };

        if is_cached(&path) {
            debug!("Cache hit: {}", path.display());
            return Ok(asset);
        }

        let lock = self.key_lock(version, architecture);
        let _guard = lock.lock().await;

        // whoever held the lock before us may have filled the cache
        if is_cached(&path) {
            debug!("Cache filled while waiting: {}", path.display());
            return Ok(asset);
        }

        let compressed = self.fetch_with_retries(version, architecture).await?;
        install(&compressed, &path)?;
        info!("Cached frida-gadget {version} ({architecture}) at {}", path.display());

        Ok(asset)
    }

    /// Fetches every architecture of `version` concurrently.
    pub async fn update_all(
        &self,
        version: &str,
        force: bool,
    ) -> Vec<(Architecture, Result<GadgetAsset>)> {
        if force {
            for arch in Architecture::VARIANTS {
                if let Err(e) = self.invalidate(version, *arch) {
                    warn!("{e}");
                }
            }
        }

        let (arm, arm64, x86, x64) = tokio::join!(
            self.resolve(version, Architecture::Arm),
            self.resolve(version, Architecture::Arm64),
            self.resolve(version, Architecture::X86),
            self.resolve(version, Architecture::X64),
        );

        vec![
            (Architecture::Arm, arm),
            (Architecture::Arm64, arm64),
            (Architecture::X86, x86),
            (Architecture::X64, x64),
        ]
    }

    /// Drops a cached gadget so the next resolve downloads it again.
    pub fn invalidate(&self, version: &str, architecture: Architecture) -> Result<()> {
        let version = &checked_version(version)?;
        let path = self.cache_path(version, architecture);

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Invalidated {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PatchError::from_io(&path, e)),
        }
    }

    fn key_lock(&self, version: &str, architecture: Architecture) -> KeyLock {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        in_flight
            .entry((version.to_string(), architecture))
            .or_default()
            .clone()
    }

    async fn fetch_with_retries(&self, version: &str, architecture: Architecture) -> Result<Vec<u8>> {
        let mut delay = self.backoff;
        let mut attempt = 0;

        loop {
            match self.source.fetch(version, architecture).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Fetching frida-gadget {version} ({architecture}) failed: {e}; retry {attempt}/{} in {}ms",
                        self.retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_cached(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}

/// Decompresses into a private sibling file, verifies it, then renames it
/// into place. A failed check leaves nothing behind.
fn install(compressed: &[u8], path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PatchError::InvalidInput(format!("bad cache path {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| PatchError::from_io(parent, e))?;

    let mut part = path.as_os_str().to_owned();
    part.push(format!(".part-{}", std::process::id()));
    let part = PathBuf::from(part);

    let result = decompress(compressed, &part).and_then(|()| verify_gadget(&part));

    if let Err(e) = result {
        let _ = fs::remove_file(&part);
        return Err(e);
    }

    fs::rename(&part, path).map_err(|e| {
        let _ = fs::remove_file(&part);
        PatchError::from_io(path, e)
    })
}

fn decompress(compressed: &[u8], out: &Path) -> Result<()> {
    let file = File::create(out).map_err(|e| PatchError::from_io(out, e))?;
    let mut writer = BufWriter::new(file);
    let mut decoder = XzDecoder::new(compressed);

    io::copy(&mut decoder, &mut writer).map_err(|e| PatchError::Integrity {
        path: out.to_path_buf(),
        reason: format!("xz decompression failed: {e}"),
    })?;

    writer.flush().map_err(|e| PatchError::from_io(out, e))
}

/// Versions name cache directories, so they must stay a single plain component.
fn checked_version(version: &str) -> Result<String> {
    normalize_version(version)
        .map_err(|e| PatchError::InvalidInput(format!("gadget version {version:?}: {e}")))
}
