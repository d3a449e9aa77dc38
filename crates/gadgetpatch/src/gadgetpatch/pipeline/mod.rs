//! Drives one patch session from a validated request to a signed APK.
//!
//! ```text
//! Validated → Decoded → Resolved → Injected → ManifestPatched
//!           → (checkpoints) → Rebuilt → Signed → Finalized
//! ```
//!
//! Any stage error stops the run and is reported together with the stage it
//! happened in and the last state that was reached.

use crate::gadgetpatch::adb::DeviceBridge;
use crate::gadgetpatch::apk::zipalign::ZipAlign;
use crate::gadgetpatch::apk::{DecodedApk, Toolchain};
use crate::gadgetpatch::deps;
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::gadget::{GadgetAsset, GadgetResolver, GadgetSource, verify_gadget};
use crate::gadgetpatch::patch::injector::{self, ApplyOutcome, InjectionPlan};
use crate::gadgetpatch::patch::manifest::{self, INTERNET_PERMISSION, ManifestEdit, ManifestInfo};
use crate::gadgetpatch::tui::progress::create_spinner;
use crate::gadgetpatch::utils::move_file;
use gadgetpatch_derive::EnumChoice;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod hooks;
pub mod session;

pub use hooks::{Checkpoint, ExecCommand, WaitForUser};
pub use session::{PatchOptions, PatchRequest, PatchSession};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumChoice)]
pub enum PipelineState {
    Validated,
    Decoded,
    Resolved,
    Injected,
    #[choice(name = "manifest-patched")]
    ManifestPatched,
    Rebuilt,
    Signed,
    Finalized,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub output: PathBuf,
    pub state: PipelineState,
    pub already_patched: bool,
    /// Set when the working directory was kept on request
    pub work_dir_kept: Option<PathBuf>,
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct SessionFailure {
    /// Last state completed before the failure
    pub reached: PipelineState,
    /// Stage that was running when it failed
    pub stage: PipelineState,
    #[source]
    pub error: PatchError,
    pub preserved_work_dir: Option<PathBuf>,
}

type StageResult<T> = std::result::Result<T, (PipelineState, PatchError)>;

trait AtStage<T> {
    fn at(self, stage: PipelineState) -> StageResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: PipelineState) -> StageResult<T> {
        self.map_err(|e| (stage, e))
    }
}

struct Progress {
    reached: PipelineState,
    abort: Arc<AtomicBool>,
}

impl Progress {
    /// Checks for cancellation, then records that `next` is starting.
    fn begin(&self, next: PipelineState) -> StageResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err((next, PatchError::Aborted));
        }

        if next <= self.reached || next == PipelineState::Failed {
            return Err((
                next,
                PatchError::Other(anyhow::anyhow!(
                    "stage {next} cannot follow {}",
                    self.reached
                )),
            ));
        }

        debug!("Entering {next}");
        Ok(())
    }

    fn complete(&mut self, state: PipelineState) {
        self.reached = state;
        info!("Reached {state}");
    }
}

pub struct Pipeline<T, S> {
    toolchain: T,
    resolver: GadgetResolver<S>,
    bridge: Arc<dyn DeviceBridge>,
    checkpoints: Vec<Box<dyn Checkpoint>>,
    abort: Arc<AtomicBool>,
}

impl<T: Toolchain, S: GadgetSource> Pipeline<T, S> {
    pub fn new(toolchain: T, resolver: GadgetResolver<S>, bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            toolchain,
            resolver,
            bridge,
            checkpoints: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Checkpoint + 'static) -> Self {
        self.checkpoints.push(Box::new(checkpoint));
        self
    }

    /// Adds the checkpoints a session's options ask for: `--exec` first,
    /// then `--wait`.
    pub fn with_session_checkpoints(mut self, options: &PatchOptions) -> Self {
        if let Some(command) = &options.exec_command {
            self = self.with_checkpoint(ExecCommand::new(
                command.clone(),
                options.pass_temp_path,
                options.assume_yes,
            ));
        }

        if options.wait {
            self = self.with_checkpoint(WaitForUser::new());
        }

        self
    }

    /// Setting the flag stops the run at the next stage boundary.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    pub fn resolver(&self) -> &GadgetResolver<S> {
        &self.resolver
    }

    pub async fn run(&self, session: PatchSession) -> std::result::Result<PatchOutcome, SessionFailure> {
        let mut progress = Progress {
            reached: PipelineState::Validated,
            abort: self.abort.clone(),
        };

        info!(
            "Patching {} into {}",
            session.source.display(),
            session.output.display()
        );

        match self.execute(&session, &mut progress).await {
            Ok(outcome) => Ok(outcome),
            Err((stage, error)) => {
                let work_dir = session.work.dir().to_path_buf();
                let preserved_work_dir = if !session.work.is_claimed() {
                    // refused or never reached; whatever is there is not ours
                    None
                } else if session.options.cleanup_on_failure {
                    if let Err(e) = session.work.finalize() {
                        warn!("Could not remove working directory: {e}");
                    }
                    None
                } else {
                    work_dir.exists().then_some(work_dir)
                };

                error!("{stage} stage failed: {error}");
                if let Some(dir) = &preserved_work_dir {
                    info!("Working directory preserved at {}", dir.display());
                }

                Err(SessionFailure {
                    reached: progress.reached,
                    stage,
                    error,
                    preserved_work_dir,
                })
            }
        }
    }

    async fn execute(&self, session: &PatchSession, progress: &mut Progress) -> StageResult<PatchOutcome> {
        use PipelineState::*;

        let options = &session.options;

        progress.begin(Decoded)?;
        deps::ensure(&self.toolchain.required_tools()).at(Decoded)?;
        let mut decoded = session
            .work
            .decode(
                &self.toolchain,
                &session.source,
                options.needs_resources(),
                options.force_resources,
            )
            .at(Decoded)?;
        progress.complete(Decoded);

        progress.begin(Resolved)?;
        let prepared = if options.prevent_gadget {
            info!("Gadget injection disabled, skipping resolution");
            None
        } else {
            Some(self.prepare_gadget(session, &decoded).await.at(Resolved)?)
        };
        progress.complete(Resolved);

        progress.begin(Injected)?;
        let already_patched = match &prepared {
            None => {
                info!("Gadget injection disabled, leaving smali untouched");
                false
            }
            Some((plan, None)) => {
                info!("{} already loads the gadget, skipping injection", plan.entry_class);
                true
            }
            Some((plan, Some(gadget))) => {
                let outcome = injector::apply(
                    plan,
                    &mut decoded,
                    gadget,
                    options.autoload_script.as_deref(),
                )
                .at(Injected)?;
                outcome == ApplyOutcome::AlreadyPatched
            }
        };
        progress.complete(Injected);

        progress.begin(ManifestPatched)?;
        let edit = ManifestEdit {
            add_permissions: if options.prevent_gadget {
                Vec::new()
            } else {
                vec![INTERNET_PERMISSION.to_string()]
            },
            extract_native_libs: !options.prevent_gadget,
            user_certificates: options.enable_user_certs,
        };
        manifest::apply_edits(&decoded, &edit).at(ManifestPatched)?;
        progress.complete(ManifestPatched);

        for checkpoint in &self.checkpoints {
            progress.begin(Rebuilt)?;
            debug!("Running {} checkpoint", checkpoint.name());
            checkpoint
                .before_rebuild(session.work.decoded_dir().as_path())
                .at(Rebuilt)?;
        }

        progress.begin(Rebuilt)?;
        let unsigned = session
            .work
            .rebuild(&self.toolchain, &decoded, options.use_aapt2)
            .at(Rebuilt)?;
        progress.complete(Rebuilt);

        progress.begin(Signed)?;
        let signed = self.sign(session, &unsigned).at(Signed)?;
        progress.complete(Signed);

        progress.begin(Finalized)?;
        if let Some(parent) = session.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| PatchError::from_io(parent, e))
                .at(Finalized)?;
        }
        move_file(&signed, &session.output).at(Finalized)?;

        let work_dir_kept = if options.keep_work_dir {
            info!("Keeping working directory {}", session.work.dir().display());
            Some(session.work.dir().to_path_buf())
        } else {
            session.work.clone().finalize().at(Finalized)?;
            None
        };
        progress.complete(Finalized);

        info!("Patched APK written to {}", session.output.display());

        Ok(PatchOutcome {
            output: session.output.clone(),
            state: Finalized,
            already_patched,
            work_dir_kept,
        })
    }

    /// Plans the injection and, unless the entry class already loads the
    /// gadget, picks an architecture and gets the gadget binary.
    async fn prepare_gadget(
        &self,
        session: &PatchSession,
        decoded: &DecodedApk,
    ) -> Result<(InjectionPlan, Option<GadgetAsset>)> {
        let info = ManifestInfo::read(&decoded.manifest_path())?;
        let mut plan = injector::plan(decoded, &info)?;

        if plan.already_patched {
            return Ok((plan, None));
        }

        let architecture = injector::resolve_architecture(
            session.arch,
            decoded,
            self.bridge.clone(),
            session.device_timeout,
        )
        .await?;
        plan.architecture = Some(architecture);

        let gadget = match &session.options.gadget_override {
            Some(path) => {
                verify_gadget(path)?;
                info!("Using gadget {}", path.display());
                GadgetAsset {
                    version: "custom".to_string(),
                    architecture,
                    path: path.clone(),
                }
            }
            None => {
                let version = self.resolver.resolve_version(&session.version).await?;
                self.resolver.resolve(&version, architecture).await?
            }
        };

        info!(
            "Injecting frida-gadget {} ({}) into {}",
            gadget.version, gadget.architecture, plan.entry_class
        );

        Ok((plan, Some(gadget)))
    }

    /// zipalign, verify alignment, then apksigner. A keystore generated for
    /// this run is removed afterwards unless it should be kept.
    fn sign(&self, session: &PatchSession, unsigned: &std::path::Path) -> Result<PathBuf> {
        let aligned = session.work.build_dir().join("aligned.apk");
        let keystore = &session.keystore;

        let spinner = create_spinner("Aligning APK...");
        let result = self.toolchain.align(unsigned, &aligned);
        spinner.finish_and_clear();
        result?;

        let misaligned = ZipAlign::new(aligned.clone(), 4).verify()?;
        if let Some(first) = misaligned.first() {
            return Err(PatchError::Signing(format!(
                "{} stored entries are not 4-byte aligned (first: {} at {})",
                misaligned.len(),
                first.name,
                first.data_start
            )));
        }

        let generated = !keystore.path.exists();
        if generated {
            info!("Generating signing keystore at {}", keystore.path.display());
            self.toolchain.generate_keystore(keystore)?;
        }

        let spinner = create_spinner("Signing APK...");
        let result = self.toolchain.sign(&aligned, keystore);
        spinner.finish_and_clear();

        if generated && !session.options.keep_keystore {
            match fs::remove_file(&keystore.path) {
                Ok(()) => debug!("Removed generated keystore"),
                Err(e) => warn!("Could not remove {}: {e}", keystore.path.display()),
            }
        }

        result?;
        Ok(aligned)
    }
}
