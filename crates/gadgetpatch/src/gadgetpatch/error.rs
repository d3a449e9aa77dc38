//! Error taxonomy for the patch pipeline.
//!
//! Every stage reports one of these; the orchestrator wraps them with the
//! stage that was running when they surfaced.

use crate::gadgetpatch::arch::Architecture;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    /// External tools absent from PATH, checked before any side effect
    #[error("Missing required dependencies: {}", .missing.join(", "))]
    DependencyMissing { missing: Vec<String> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to decode APK: {0}")]
    Decode(String),

    #[error("Failed to rebuild APK: {0}")]
    Rebuild(String),

    #[error("Failed to patch manifest: {0}")]
    ManifestPatch(String),

    #[error("Entry point '{class}' has no smali source{}", hint_suffix(.hint))]
    EntryPointNotFound { class: String, hint: Option<String> },

    #[error("Cannot choose a target architecture automatically: {}", describe_found(.found))]
    AmbiguousArchitecture { found: Vec<Architecture> },

    #[error("No gadget published for frida {version} on {architecture}")]
    NotFound {
        version: String,
        architecture: Architecture,
    },

    #[error("Gadget '{}' failed verification: {reason}", .path.display())]
    Integrity { path: PathBuf, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to sign APK: {0}")]
    Signing(String),

    #[error("Pre-rebuild hook failed: {0}")]
    Hook(String),

    #[error("Aborted before completion")]
    Aborted,

    #[error("File I/O error for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

impl PatchError {
    pub fn from_io(path: impl AsRef<Path>, error: io::Error) -> Self {
        PatchError::Io {
            path: path.as_ref().to_path_buf(),
            source: error,
        }
    }

    /// Only transport failures are worth another attempt; integrity failures
    /// and missing assets will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PatchError::Network(_))
    }
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(closest) => format!(" (closest smali class: {closest})"),
        None => String::new(),
    }
}

fn describe_found(found: &[Architecture]) -> String {
    if found.is_empty() {
        return "the APK ships no native libraries and no device answered; pass --arch"
            .to_string();
    }

    let names = found
        .iter()
        .map(Architecture::name)
        .collect::<Vec<_>>()
        .join(", ");

    format!("the APK ships libraries for {names}; pass --arch to pick one")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_missing_lists_every_tool() {
        let err = PatchError::DependencyMissing {
            missing: vec!["apktool".into(), "zipalign".into()],
        };
        assert_eq!(
            err.to_string(),
            "Missing required dependencies: apktool, zipalign"
        );
    }

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(PatchError::Network("reset".into()).is_retryable());
        assert!(
            !PatchError::Integrity {
                path: PathBuf::from("x.so"),
                reason: "bad magic".into(),
            }
            .is_retryable()
        );
        assert!(
            !PatchError::NotFound {
                version: "1.0.0".into(),
                architecture: Architecture::Arm,
            }
            .is_retryable()
        );
    }

    #[test]
    fn ambiguous_architecture_names_candidates() {
        let err = PatchError::AmbiguousArchitecture {
            found: vec![Architecture::Arm, Architecture::Arm64],
        };
        assert!(err.to_string().contains("arm, arm64"));

        let none = PatchError::AmbiguousArchitecture { found: vec![] };
        assert!(none.to_string().contains("no native libraries"));
    }

    #[test]
    fn entry_point_hint_is_optional() {
        let err = PatchError::EntryPointNotFound {
            class: "com.example.Main".into(),
            hint: None,
        };
        assert_eq!(
            err.to_string(),
            "Entry point 'com.example.Main' has no smali source"
        );

        let err = PatchError::EntryPointNotFound {
            class: "com.example.Main".into(),
            hint: Some("com.example.MainActivity".into()),
        };
        assert!(err.to_string().ends_with("(closest smali class: com.example.MainActivity)"));
    }
}
