//! The external APK toolchain: decompiler, recompiler, aligner and signer.
//!
//! The pipeline only talks to the [`Toolchain`] trait, so another backend
//! (a pinned apktool build, a remote build service, a test double) can be
//! swapped in without touching the stages.

use crate::gadgetpatch::config::{Config, KeystoreConfig};
use crate::gadgetpatch::deps::{self, Dependency};
use crate::gadgetpatch::error::{PatchError, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait Toolchain {
    /// Programs that must be on PATH before the first side effect.
    fn required_tools(&self) -> Vec<Dependency> {
        Vec::new()
    }

    fn decode(&self, apk: &Path, out_dir: &Path, decode_resources: bool) -> Result<ToolOutput>;

    fn rebuild(&self, tree: &Path, out_apk: &Path, use_aapt2: bool) -> Result<ToolOutput>;

    fn align(&self, input: &Path, output: &Path) -> Result<ToolOutput>;

    fn generate_keystore(&self, keystore: &KeystoreConfig) -> Result<ToolOutput>;

    fn sign(&self, apk: &Path, keystore: &KeystoreConfig) -> Result<ToolOutput>;
}

#[derive(Debug, Clone)]
enum Launcher {
    Binary(PathBuf),
    Jar { java: PathBuf, jar: PathBuf },
}

/// Process-backed toolchain: apktool, zipalign, keytool and apksigner.
#[derive(Debug, Clone)]
pub struct Apktool {
    launcher: Launcher,
}

impl Apktool {
    pub fn from_config(config: &Config) -> Self {
        let launcher = match &config.apktool_jar {
            Some(jar) => Launcher::Jar {
                java: java_binary(),
                jar: jar.clone(),
            },
            None => Launcher::Binary(PathBuf::from("apktool")),
        };

        Self { launcher }
    }

    fn apktool(&self, args: Vec<OsString>) -> std::result::Result<ToolOutput, String> {
        match &self.launcher {
            Launcher::Binary(bin) => execute_command(bin.as_os_str(), &args),
            Launcher::Jar { java, jar } => {
                let mut full: Vec<OsString> = vec!["-jar".into(), jar.clone().into()];
                full.extend(args);
                execute_command(java.as_os_str(), &full)
            }
        }
    }
}

/// Prefers the JDK found by `java-locator`, falling back to `java` on PATH.
fn java_binary() -> PathBuf {
    let exe = if cfg!(windows) { "java.exe" } else { "java" };

    match java_locator::locate_java_home() {
        Ok(home) => PathBuf::from(home).join("bin").join(exe),
        Err(e) => {
            warn!("Could not locate JAVA_HOME ({e}), using java from PATH");
            PathBuf::from(exe)
        }
    }
}

impl Toolchain for Apktool {
    fn required_tools(&self) -> Vec<Dependency> {
        let first = match self.launcher {
            Launcher::Binary(_) => deps::APKTOOL,
            Launcher::Jar { .. } => deps::JAVA,
        };

        vec![first, deps::ZIPALIGN, deps::APKSIGNER, deps::KEYTOOL]
    }

    fn decode(&self, apk: &Path, out_dir: &Path, decode_resources: bool) -> Result<ToolOutput> {
        let mut args: Vec<OsString> = vec![
            "d".into(),
            apk.into(),
            "-o".into(),
            out_dir.into(),
            "-f".into(),
        ];

        if !decode_resources {
            args.push("--no-res".into());
        }

        self.apktool(args).map_err(PatchError::Decode)
    }

    fn rebuild(&self, tree: &Path, out_apk: &Path, use_aapt2: bool) -> Result<ToolOutput> {
        let mut args: Vec<OsString> = vec!["b".into(), tree.into(), "-o".into(), out_apk.into()];

        if use_aapt2 {
            args.push("--use-aapt2".into());
        }

        self.apktool(args).map_err(PatchError::Rebuild)
    }

    fn align(&self, input: &Path, output: &Path) -> Result<ToolOutput> {
        let args: Vec<OsString> = vec![
            "-p".into(),
            "-f".into(),
            "4".into(),
            input.into(),
            output.into(),
        ];

        execute_command(OsStr::new("zipalign"), &args).map_err(PatchError::Signing)
    }

    fn generate_keystore(&self, keystore: &KeystoreConfig) -> Result<ToolOutput> {
        let args: Vec<OsString> = vec![
            "-genkey".into(),
            "-keyalg".into(),
            "RSA".into(),
            "-keysize".into(),
            "2048".into(),
            "-validity".into(),
            keystore.validity_days.to_string().into(),
            "-noprompt".into(),
            "-alias".into(),
            (&keystore.alias).into(),
            "-dname".into(),
            (&keystore.dname).into(),
            "-keystore".into(),
            keystore.path.clone().into(),
            "-storepass".into(),
            (&keystore.password).into(),
            "-keypass".into(),
            (&keystore.password).into(),
        ];

        execute_command(OsStr::new("keytool"), &args).map_err(PatchError::Signing)
    }

    fn sign(&self, apk: &Path, keystore: &KeystoreConfig) -> Result<ToolOutput> {
        let pass = format!("pass:{}", keystore.password);
        let args: Vec<OsString> = vec![
            "sign".into(),
            "--ks".into(),
            keystore.path.clone().into(),
            "--ks-key-alias".into(),
            (&keystore.alias).into(),
            "--ks-pass".into(),
            (&pass).into(),
            "--key-pass".into(),
            (&pass).into(),
            "--v1-signing-enabled".into(),
            "true".into(),
            "--v2-signing-enabled".into(),
            "true".into(),
            apk.into(),
        ];

        execute_command(OsStr::new("apksigner"), &args).map_err(PatchError::Signing)
    }
}

/// Runs a command to completion. On a non-zero exit the tool's own stderr
/// (or stdout, when stderr is empty) is returned untouched.
pub fn execute_command(cmd: &OsStr, args: &[OsString]) -> std::result::Result<ToolOutput, String> {
    debug!("Running {} {:?}", cmd.to_string_lossy(), args);

    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute {}: {e}", cmd.to_string_lossy()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", cmd.to_string_lossy(), stderr.trim_end());
        }

        return Ok(ToolOutput { stdout, stderr });
    }

    let diagnostic = if stderr.trim().is_empty() { stdout } else { stderr };

    Err(format!(
        "{} exited with {}\n{}",
        cmd.to_string_lossy(),
        output.status,
        diagnostic.trim_end()
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn execute_command_captures_stdout() {
        let out = execute_command(OsStr::new("sh"), &["-c".into(), "echo decoded".into()]).unwrap();
        assert_eq!(out.stdout.trim(), "decoded");
    }

    #[test]
    fn execute_command_surfaces_stderr_verbatim() {
        let err = execute_command(
            OsStr::new("sh"),
            &["-c".into(), "echo 'W: Could not decode attr value' >&2; exit 1".into()],
        )
        .unwrap_err();

        assert!(err.contains("W: Could not decode attr value"));
        assert!(err.starts_with("sh exited with"));
    }

    #[test]
    fn missing_binary_is_reported() {
        let err = execute_command(OsStr::new("gadgetpatch-no-such-tool"), &[]).unwrap_err();
        assert!(err.contains("failed to execute gadgetpatch-no-such-tool"));
    }

    #[test]
    fn jar_launcher_requires_java() {
        let config = Config {
            apktool_jar: Some(PathBuf::from("apktool.jar")),
            ..Config::default()
        };

        let tools = Apktool::from_config(&config).required_tools();
        assert_eq!(tools[0], deps::JAVA);
        assert!(tools.contains(&deps::APKSIGNER));
    }
}
