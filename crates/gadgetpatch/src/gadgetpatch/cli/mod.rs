use crate::gadgetpatch::arch::ArchRequest;
use crate::gadgetpatch::gadget::VersionRequest;
use crate::gadgetpatch::pipeline::{PatchOptions, PatchRequest};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

pub mod program;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Log verbosity: 1 = errors, 2 = warnings, 3 = info
    #[arg(short = 'v', long, global = true, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub verbosity: u8,

    /// Debug output, overrides --verbosity
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file (TOML)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_level(&self) -> Level {
        if self.debug {
            return Level::DEBUG;
        }

        match self.verbosity {
            1 => Level::ERROR,
            2 => Level::WARN,
            _ => Level::INFO,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inject the Frida gadget into an APK and re-sign it
    Patch(PatchArgs),

    /// Download gadgets for every architecture into the cache
    UpdateGadgets {
        /// Frida version, or `latest`
        #[arg(default_value = "latest")]
        version: VersionRequest,

        /// Re-download gadgets that are already cached
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// List connected ADB devices and their ABI
    Devices,
}

#[derive(Args, Debug)]
pub struct PatchArgs {
    /// APK to patch
    pub apk: PathBuf,

    /// Where to write the patched APK (defaults to `<name>_patched.apk`)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Target architecture: arm, arm64, x86, x86_64 or auto
    #[arg(short = 'a', long, default_value = "auto")]
    pub arch: ArchRequest,

    /// Don't ask a connected device for its architecture
    #[arg(long)]
    pub no_device: bool,

    /// Frida version to inject (defaults to the installed frida, else latest)
    #[arg(short = 'g', long = "gadget-version")]
    pub version: Option<VersionRequest>,

    /// Use this gadget binary instead of a downloaded one
    #[arg(long)]
    pub gadget: Option<PathBuf>,

    /// Trust user-installed CA certificates
    #[arg(short = 'u', long)]
    pub enable_user_certificates: bool,

    /// Only rebuild and re-sign, do not inject the gadget
    #[arg(long = "no-gadget")]
    pub prevent_gadget: bool,

    /// Decode resources even when no stage needs them
    #[arg(long)]
    pub force_resources: bool,

    /// Keep a keystore generated for this run
    #[arg(long)]
    pub keep_keystore: bool,

    /// Rebuild with aapt2
    #[arg(long)]
    pub use_aapt2: bool,

    /// Pause before rebuilding so the decoded tree can be edited
    #[arg(short = 'w', long)]
    pub wait: bool,

    /// Script for the gadget to load on start
    #[arg(short = 's', long)]
    pub autoload_script: Option<PathBuf>,

    /// Shell command to run in the working directory before rebuilding
    #[arg(short = 'x', long = "exec")]
    pub exec_command: Option<String>,

    /// Pass the working directory to --exec (replaces TMP_PATH_HERE, or is appended)
    #[arg(long, requires = "exec_command")]
    pub pass_temp_path: bool,

    /// Working directory to use instead of a generated one
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Keep the working directory after a successful run
    #[arg(long)]
    pub keep_work_dir: bool,

    /// Remove the working directory even when the run fails
    #[arg(long)]
    pub cleanup_on_failure: bool,

    /// Don't ask before running --exec
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl PatchArgs {
    /// `default_version` fills in when no version was given.
    pub fn into_request(self, default_version: VersionRequest) -> PatchRequest {
        PatchRequest {
            source: self.apk,
            output: self.output,
            arch: self.arch,
            version: self.version.unwrap_or(default_version),
            options: PatchOptions {
                enable_user_certs: self.enable_user_certificates,
                prevent_gadget: self.prevent_gadget,
                force_resources: self.force_resources,
                keep_keystore: self.keep_keystore,
                use_aapt2: self.use_aapt2,
                wait: self.wait,
                autoload_script: self.autoload_script,
                exec_command: self.exec_command,
                pass_temp_path: self.pass_temp_path,
                gadget_override: self.gadget,
                keep_work_dir: self.keep_work_dir,
                cleanup_on_failure: self.cleanup_on_failure,
                work_dir: self.work_dir,
                assume_yes: self.yes,
            },
        }
    }
}
