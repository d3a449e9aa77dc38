use crate::gadgetpatch::apk::WorkingTree;
use crate::gadgetpatch::apk::apk_utils::ApkUtils;
use crate::gadgetpatch::arch::ArchRequest;
use crate::gadgetpatch::config::{Config, KeystoreConfig};
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::gadget::VersionRequest;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    pub enable_user_certs: bool,
    /// Skip gadget resolution and injection entirely
    pub prevent_gadget: bool,
    pub force_resources: bool,
    pub keep_keystore: bool,
    pub use_aapt2: bool,
    pub wait: bool,
    pub autoload_script: Option<PathBuf>,
    pub exec_command: Option<String>,
    pub pass_temp_path: bool,
    /// Use this gadget instead of resolving one
    pub gadget_override: Option<PathBuf>,
    pub keep_work_dir: bool,
    pub cleanup_on_failure: bool,
    pub work_dir: Option<PathBuf>,
    pub assume_yes: bool,
}

impl PatchOptions {
    /// Resources must be decoded whenever a stage reads or edits the
    /// text manifest.
    pub fn needs_resources(&self) -> bool {
        self.force_resources || self.enable_user_certs || !self.prevent_gadget
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    pub source: PathBuf,
    pub output: Option<PathBuf>,
    pub arch: ArchRequest,
    pub version: VersionRequest,
    pub options: PatchOptions,
}

/// A validated request plus everything it owns on disk.
#[derive(Debug)]
pub struct PatchSession {
    pub source: PathBuf,
    pub output: PathBuf,
    pub work: WorkingTree,
    pub arch: ArchRequest,
    pub version: VersionRequest,
    pub options: PatchOptions,
    pub keystore: KeystoreConfig,
    pub device_timeout: Duration,
}

impl PatchSession {
    pub fn new(request: PatchRequest, config: &Config) -> Result<Self> {
        let apk = ApkUtils::new(request.source)?;
        let options = request.options;

        if let Some(script) = &options.autoload_script {
            if !script.is_file() {
                return Err(PatchError::InvalidInput(format!(
                    "autoload script {} does not exist",
                    script.display()
                )));
            }
        }

        if let Some(gadget) = &options.gadget_override {
            if !gadget.is_file() {
                return Err(PatchError::InvalidInput(format!(
                    "gadget {} does not exist",
                    gadget.display()
                )));
            }
        }

        if options.pass_temp_path && options.exec_command.is_none() {
            return Err(PatchError::InvalidInput(
                "--pass-temp-path requires --exec".to_string(),
            ));
        }

        if options.prevent_gadget && (options.autoload_script.is_some() || options.gadget_override.is_some()) {
            warn!("--no-gadget is set, the gadget and autoload script options are ignored");
        }

        let libs = apk.native_lib_entries()?;
        debug!("{} ships {} native librar(ies)", apk.path().display(), libs.len());

        let source = apk.path().to_path_buf();
        let output = match request.output {
            Some(output) => output,
            None => default_output(&source),
        };

        if resolved(&output) == resolved(&source) {
            return Err(PatchError::InvalidInput(
                "output would overwrite the source APK".to_string(),
            ));
        }

        let work_dir = match &options.work_dir {
            Some(dir) => dir.clone(),
            None => config.temp_dir.join(session_dir_name(&source)),
        };
        debug!("Session working directory: {}", work_dir.display());
        let work = WorkingTree::new(work_dir);

        let mut keystore = config.keystore.clone();
        if keystore.is_per_session() {
            keystore.path = if options.keep_keystore {
                output.with_extension("keystore")
            } else {
                work.build_dir().join("gadgetpatch.keystore")
            };
        }

        Ok(Self {
            source,
            output,
            work,
            arch: request.arch,
            version: request.version,
            options,
            keystore,
            device_timeout: config.device_timeout(),
        })
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string())
}

/// `path` with symlinks and `.`/`..` resolved, as far as it exists.
fn resolved(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    match (parent.canonicalize(), path.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// `<stem>-<12 hex chars>`, unique per source path and start time.
fn session_dir_name(source: &Path) -> String {
    let canonical = source
        .canonicalize()
        .unwrap_or_else(|_| source.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(now().as_nanos().to_le_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}-{}", file_stem(source), &digest[..12])
}

/// `<dir>/<stem>_patched.apk`, or `<stem>_patched_<millis>.apk` when that
/// is taken.
fn default_output(source: &Path) -> PathBuf {
    let stem = file_stem(source);
    let preferred = source.with_file_name(format!("{stem}_patched.apk"));

    if !preferred.exists() {
        return preferred;
    }

    let suffixed = source.with_file_name(format!("{stem}_patched_{}.apk", now().as_millis()));
    warn!(
        "{} already exists, writing {} instead",
        preferred.display(),
        suffixed.display()
    );

    suffixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadgetpatch::testing::sample_apk;

    fn config(root: &Path) -> Config {
        Config {
            temp_dir: root.join("work"),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_output_next_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let apk = sample_apk(dir.path(), &[]);
        let request = PatchRequest {
            source: apk.clone(),
            ..PatchRequest::default()
        };

        let session = PatchSession::new(request.clone(), &config(dir.path())).unwrap();
        assert_eq!(session.output, dir.path().join("app_patched.apk"));

        let name = session.work.dir().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("app-"));
        assert_eq!(name.len(), "app-".len() + 12);
        assert!(session.work.dir().starts_with(dir.path().join("work")));

        std::fs::write(dir.path().join("app_patched.apk"), b"taken").unwrap();
        let session = PatchSession::new(request, &config(dir.path())).unwrap();
        let output = session.output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(output.starts_with("app_patched_") && output.ends_with(".apk"));
    }

    #[test]
    fn two_sessions_get_distinct_directories() {
        let dir = tempfile::tempdir().unwrap();
        let apk = sample_apk(dir.path(), &[]);

        let a = session_dir_name(&apk);
        std::thread::sleep(Duration::from_millis(2));
        let b = session_dir_name(&apk);

        assert_ne!(a, b);
    }

    #[test]
    fn rejects_inconsistent_options() {
        let dir = tempfile::tempdir().unwrap();
        let apk = sample_apk(dir.path(), &[]);

        let request = PatchRequest {
            source: apk.clone(),
            options: PatchOptions {
                pass_temp_path: true,
                ..PatchOptions::default()
            },
            ..PatchRequest::default()
        };
        assert!(matches!(
            PatchSession::new(request, &config(dir.path())),
            Err(PatchError::InvalidInput(_))
        ));

        let request = PatchRequest {
            source: apk,
            options: PatchOptions {
                autoload_script: Some(dir.path().join("missing.js")),
                ..PatchOptions::default()
            },
            ..PatchRequest::default()
        };
        assert!(matches!(
            PatchSession::new(request, &config(dir.path())),
            Err(PatchError::InvalidInput(msg)) if msg.contains("missing.js")
        ));
    }

    #[test]
    fn resources_follow_enabled_stages() {
        let mut options = PatchOptions::default();
        assert!(options.needs_resources());

        options.prevent_gadget = true;
        assert!(!options.needs_resources());

        options.enable_user_certs = true;
        assert!(options.needs_resources());
    }

    #[test]
    fn output_spelled_differently_still_collides_with_source() {
        let dir = tempfile::tempdir().unwrap();
        let apk = sample_apk(dir.path(), &[]);
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();

        for output in [
            dir.path().join(".").join("app.apk"),
            dir.path().join("sub").join("..").join("app.apk"),
        ] {
            let request = PatchRequest {
                source: apk.clone(),
                output: Some(output),
                ..PatchRequest::default()
            };
            assert!(matches!(
                PatchSession::new(request, &config(dir.path())),
                Err(PatchError::InvalidInput(msg)) if msg.contains("overwrite the source")
            ));
        }
    }

    #[test]
    fn per_session_keystore_stays_private() {
        let dir = tempfile::tempdir().unwrap();
        let apk = sample_apk(dir.path(), &[]);
        let request = |keep_keystore| PatchRequest {
            source: apk.clone(),
            options: PatchOptions {
                keep_keystore,
                ..PatchOptions::default()
            },
            ..PatchRequest::default()
        };

        let a = PatchSession::new(request(false), &config(dir.path())).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let b = PatchSession::new(request(false), &config(dir.path())).unwrap();
        assert!(a.keystore.path.starts_with(a.work.build_dir()));
        assert!(b.keystore.path.starts_with(b.work.build_dir()));
        assert_ne!(a.keystore.path, b.keystore.path);

        let kept = PatchSession::new(request(true), &config(dir.path())).unwrap();
        assert_eq!(kept.keystore.path, dir.path().join("app_patched.keystore"));

        let mut shared = config(dir.path());
        shared.keystore.path = dir.path().join("release.keystore");
        let configured = PatchSession::new(request(false), &shared).unwrap();
        assert_eq!(configured.keystore.path, dir.path().join("release.keystore"));
    }
}
