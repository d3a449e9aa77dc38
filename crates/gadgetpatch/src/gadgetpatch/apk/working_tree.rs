//! Owns one session's directory: decode into it, rebuild out of it, and
//! remove it when the session is done.
//!
//! Layout:
//!
//! ```text
//! <session>/decoded/   apktool output (smali*, res, lib, AndroidManifest.xml)
//! <session>/build/     unsigned, aligned and signed archives
//! ```

use crate::gadgetpatch::apk::toolchain::Toolchain;
use crate::gadgetpatch::arch::Architecture;
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::tui::progress::create_spinner;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "AndroidManifest.xml";

/// The exploded APK produced by a decode.
#[derive(Debug, Clone)]
pub struct DecodedApk {
    root: PathBuf,
    smali_roots: Vec<PathBuf>,
    resources_decoded: bool,
    /// ABI directory name → `.so` files inside it
    native_libs: BTreeMap<String, Vec<PathBuf>>,
}

impl DecodedApk {
    pub fn scan(root: &Path, resources_decoded: bool) -> Result<Self> {
        let mut smali_roots = Vec::new();

        for entry in fs::read_dir(root).map_err(|e| PatchError::from_io(root, e))? {
            let entry = entry.map_err(|e| PatchError::from_io(root, e))?;
            let name = entry.file_name();

            if name.to_string_lossy().starts_with("smali") && entry.path().is_dir() {
                smali_roots.push(entry.path());
            }
        }

        // smali, smali_classes2, smali_classes3, ... in load order
        smali_roots.sort_by_key(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned());
            let index = name
                .as_deref()
                .and_then(|n| n.strip_prefix("smali_classes"))
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(if name.as_deref() == Some("smali") { 1 } else { u32::MAX });
            (index, name)
        });

        let mut decoded = Self {
            root: root.to_path_buf(),
            smali_roots,
            resources_decoded,
            native_libs: BTreeMap::new(),
        };
        decoded.rescan_native_libs()?;

        Ok(decoded)
    }

    pub fn rescan_native_libs(&mut self) -> Result<()> {
        self.native_libs.clear();
        let lib_root = self.lib_root();

        if !lib_root.is_dir() {
            return Ok(());
        }

        for abi_dir in fs::read_dir(&lib_root).map_err(|e| PatchError::from_io(&lib_root, e))? {
            let abi_dir = abi_dir.map_err(|e| PatchError::from_io(&lib_root, e))?.path();

            if !abi_dir.is_dir() {
                continue;
            }

            let abi = abi_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut libs = Vec::new();

            for lib in fs::read_dir(&abi_dir).map_err(|e| PatchError::from_io(&abi_dir, e))? {
                let lib = lib.map_err(|e| PatchError::from_io(&abi_dir, e))?.path();

                if lib.extension().is_some_and(|ext| ext == "so") {
                    libs.push(lib);
                }
            }

            libs.sort();
            self.native_libs.insert(abi, libs);
        }

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn res_dir(&self) -> PathBuf {
        self.root.join("res")
    }

    pub fn lib_root(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn smali_roots(&self) -> &[PathBuf] {
        &self.smali_roots
    }

    pub fn resources_decoded(&self) -> bool {
        self.resources_decoded
    }

    pub fn native_libs(&self) -> &BTreeMap<String, Vec<PathBuf>> {
        &self.native_libs
    }

    /// Architectures with at least one library in the tree. ABI directories
    /// that are empty or unknown (`mips`, ...) don't count.
    pub fn architectures(&self) -> BTreeSet<Architecture> {
        self.native_libs
            .iter()
            .filter(|(_, libs)| !libs.is_empty())
            .filter_map(|(abi, _)| Architecture::from_abi(abi))
            .collect()
    }

    /// ABI directories a library for `architecture` should be written to:
    /// every existing one of that family, or the primary ABI when none exist.
    pub fn lib_dirs_for(&self, architecture: Architecture) -> Vec<PathBuf> {
        let existing: Vec<PathBuf> = architecture
            .abi_dirs()
            .iter()
            .filter(|abi| self.native_libs.contains_key(**abi))
            .map(|abi| self.lib_root().join(abi))
            .collect();

        if existing.is_empty() {
            vec![self.lib_root().join(architecture.primary_abi())]
        } else {
            existing
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkingTree {
    dir: PathBuf,
    /// Set once `prepare` has taken the directory for this session
    claimed: Arc<AtomicBool>,
}

impl WorkingTree {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this session created (or was allowed to wipe) the directory.
    /// An unclaimed directory may belong to someone else.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn decoded_dir(&self) -> PathBuf {
        self.dir.join("decoded")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.dir.join("build")
    }

    /// Claims the session directory. A non-empty directory belongs to an
    /// earlier (or concurrent) session and is refused unless `force`, in
    /// which case it is wiped.
    pub fn prepare(&self, force: bool) -> Result<()> {
        if self.dir.exists() {
            let occupied = fs::read_dir(&self.dir)
                .map_err(|e| PatchError::from_io(&self.dir, e))?
                .next()
                .is_some();

            if occupied && !force {
                return Err(PatchError::Decode(format!(
                    "working directory {} is not empty; pass --force-resources to wipe it",
                    self.dir.display()
                )));
            }

            if occupied {
                warn!("Wiping stale working directory {}", self.dir.display());
                fs::remove_dir_all(&self.dir).map_err(|e| PatchError::from_io(&self.dir, e))?;
            }
        }

        fs::create_dir_all(&self.dir).map_err(|e| PatchError::from_io(&self.dir, e))?;
        self.claimed.store(true, Ordering::SeqCst);
        info!("Created working directory {}", self.dir.display());

        Ok(())
    }

    pub fn decode<T: Toolchain + ?Sized>(
        &self,
        toolchain: &T,
        source: &Path,
        decode_resources: bool,
        force: bool,
    ) -> Result<DecodedApk> {
        self.prepare(force)?;

        let out = self.decoded_dir();
        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if decode_resources {
            info!("Decoding {source_name} (with resources), some resource warnings are normal");
        } else {
            info!("Decoding {source_name} (without resources)");
        }

        let spinner = create_spinner(format!("Decoding {source_name}..."));
        let result = toolchain.decode(source, &out, decode_resources);
        spinner.finish_and_clear();

        let output = result?;
        if !output.stderr.trim().is_empty() {
            debug!("decoder stderr: {}", output.stderr.trim_end());
        }

        if !out.is_dir() {
            return Err(PatchError::Decode(format!(
                "decoder reported success but produced no tree at {}",
                out.display()
            )));
        }

        let decoded = DecodedApk::scan(&out, decode_resources)?;
        debug!(
            "Decoded tree: {} smali root(s), native ABIs {:?}",
            decoded.smali_roots().len(),
            decoded.native_libs().keys().collect::<Vec<_>>()
        );

        Ok(decoded)
    }

    pub fn rebuild<T: Toolchain + ?Sized>(
        &self,
        toolchain: &T,
        decoded: &DecodedApk,
        use_aapt2: bool,
    ) -> Result<PathBuf> {
        let build = self.build_dir();
        fs::create_dir_all(&build).map_err(|e| PatchError::from_io(&build, e))?;
        let unsigned = build.join("unsigned.apk");

        info!("Rebuilding APK, this may take some time...");
        let spinner = create_spinner("Rebuilding APK...");
        let result = toolchain.rebuild(decoded.root(), &unsigned, use_aapt2);
        spinner.finish_and_clear();
        result?;

        if !unsigned.is_file() {
            return Err(PatchError::Rebuild(format!(
                "recompiler reported success but {} is missing",
                unsigned.display()
            )));
        }

        Ok(unsigned)
    }

    /// Removes the session directory.
    pub fn finalize(self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| PatchError::from_io(&self.dir, e))?;
            debug!("Removed working directory {}", self.dir.display());
        }

        Ok(())
    }
}
