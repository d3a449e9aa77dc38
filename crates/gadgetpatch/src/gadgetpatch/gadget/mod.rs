//! Frida gadget binaries: where they come from and where they are cached.

use crate::gadgetpatch::apk::toolchain::execute_command;
use crate::gadgetpatch::arch::Architecture;
use crate::gadgetpatch::deps::{self, FRIDA};
use crate::gadgetpatch::error::{PatchError, Result};
use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub mod github;
pub mod resolver;

pub use github::GithubReleases;
pub use resolver::GadgetResolver;

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// A verified, decompressed gadget on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GadgetAsset {
    pub version: String,
    pub architecture: Architecture,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VersionRequest {
    #[default]
    Latest,
    Exact(String),
}

impl FromStr for VersionRequest {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }

        normalize_version(s).map(Self::Exact)
    }
}

/// Strips a leading `v` and checks that what is left is a plain dotted
/// version token, safe to use as a cache directory and file name.
pub fn normalize_version(raw: &str) -> std::result::Result<String, String> {
    let raw = raw.trim();
    let version = raw.strip_prefix('v').unwrap_or(raw);

    if version.is_empty() {
        return Err("version must not be empty".to_string());
    }

    let valid = version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        && version.starts_with(|c: char| c.is_ascii_alphanumeric())
        && version.ends_with(|c: char| c.is_ascii_alphanumeric())
        && !version.contains("..");

    if !valid {
        return Err(format!("'{raw}' does not look like a frida version"));
    }

    Ok(version.to_string())
}

impl fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => f.write_str(v),
        }
    }
}

/// Upstream distribution channel for gadget binaries.
pub trait GadgetSource: Send + Sync {
    /// Newest published version string, e.g. `16.1.4`.
    fn latest_version(&self) -> impl Future<Output = Result<String>> + Send;

    /// The xz-compressed gadget for `version` / `architecture`.
    ///
    /// Fails with `NotFound` when upstream has no such asset and with
    /// `Network` for anything transient.
    fn fetch(
        &self,
        version: &str,
        architecture: Architecture,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// File name of a decompressed gadget in the cache.
pub fn asset_file_name(version: &str, architecture: Architecture) -> String {
    format!(
        "frida-gadget-{version}-android-{}.so",
        architecture.asset_token()
    )
}

/// Version of the locally installed `frida` CLI, if any.
///
/// A gadget that doesn't match the host frida version refuses connections,
/// so this is the preferred default over `latest`.
pub fn installed_frida_version() -> Option<String> {
    if !deps::is_available(&FRIDA) {
        return None;
    }

    match execute_command(OsStr::new(FRIDA.command), &["--version".into()]) {
        Ok(output) => {
            let version = output.stdout.trim();
            (!version.is_empty()).then(|| version.to_string())
        }
        Err(e) => {
            debug!("frida --version failed: {e}");
            None
        }
    }
}

/// Checks that `path` is a non-empty ELF object.
pub fn verify_gadget(path: &Path) -> Result<()> {
    let mut file = File::open(path).map_err(|e| PatchError::from_io(path, e))?;
    let mut magic = [0u8; 4];
    let mut read = 0;

    while read < magic.len() {
        match file.read(&mut magic[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => return Err(PatchError::from_io(path, e)),
        }
    }

    if read == 0 {
        return Err(PatchError::Integrity {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    if read < magic.len() || &magic != ELF_MAGIC {
        return Err(PatchError::Integrity {
            path: path.to_path_buf(),
            reason: format!("not an ELF object (starts with {})", hex::encode(&magic[..read])),
        });
    }

    Ok(())
}
