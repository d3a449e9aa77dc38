use crate::gadgetpatch::adb::{DeviceBridge, query_architecture};
use crate::gadgetpatch::apk::DecodedApk;
use crate::gadgetpatch::arch::{ArchRequest, Architecture};
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::gadget::GadgetAsset;
use crate::gadgetpatch::patch::manifest::ManifestInfo;
use crate::gadgetpatch::patch::smali::{self, Strategy};
use crate::gadgetpatch::utils::write_atomic;
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const GADGET_FILE: &str = "libfrida-gadget.so";
pub const GADGET_CONFIG_FILE: &str = "libfrida-gadget.config.so";
pub const AUTOLOAD_SCRIPT_FILE: &str = "libhook.js.so";

/// Where and how the loader goes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPlan {
    pub entry_class: String,
    pub smali_path: PathBuf,
    pub strategy: Strategy,
    pub already_patched: bool,
    pub architecture: Option<Architecture>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { libraries: Vec<PathBuf> },
    AlreadyPatched,
}

#[derive(Serialize)]
struct GadgetConfig {
    interaction: Interaction,
}

#[derive(Serialize)]
struct Interaction {
    #[serde(rename = "type")]
    kind: &'static str,
    address: &'static str,
    port: u16,
    path: String,
}

impl GadgetConfig {
    fn autoload() -> Self {
        Self {
            interaction: Interaction {
                kind: "script",
                address: "127.0.0.1",
                port: 27042,
                path: format!("./{AUTOLOAD_SCRIPT_FILE}"),
            },
        }
    }
}

/// Picks the architecture to inject for: an explicit request wins, then a
/// connected device, then the only ABI family the APK ships.
pub async fn resolve_architecture(
    request: ArchRequest,
    decoded: &DecodedApk,
    bridge: Arc<dyn DeviceBridge>,
    timeout: Duration,
) -> Result<Architecture> {
    if let ArchRequest::Explicit(arch) = request {
        debug!("Using requested architecture {arch}");
        return Ok(arch);
    }

    if let Some(arch) = query_architecture(bridge, timeout).await {
        return Ok(arch);
    }

    let found: Vec<Architecture> = decoded.architectures().into_iter().collect();

    match found.as_slice() {
        [only] => {
            info!("APK only ships {only} libraries, targeting {only}");
            Ok(*only)
        }
        _ => Err(PatchError::AmbiguousArchitecture { found }),
    }
}

/// Finds the entry class and decides how to patch it. Touches nothing.
pub fn plan(decoded: &DecodedApk, manifest: &ManifestInfo) -> Result<InjectionPlan> {
    let entry_class = manifest
        .entry_point()
        .ok_or_else(|| PatchError::EntryPointNotFound {
            class: "<no application class or launcher activity>".to_string(),
            hint: None,
        })?
        .to_string();

    let smali_path = locate_class(decoded, &entry_class)?;
    let source =
        fs::read_to_string(&smali_path).map_err(|e| PatchError::from_io(&smali_path, e))?;

    let already_patched = smali::has_loader(&source);
    let strategy = smali::choose_strategy(&source);

    debug!(
        "Entry point {entry_class} at {} ({strategy:?}, already patched: {already_patched})",
        smali_path.display()
    );

    Ok(InjectionPlan {
        entry_class,
        smali_path,
        strategy,
        already_patched,
        architecture: None,
    })
}

fn class_file(class: &str) -> PathBuf {
    PathBuf::from(format!("{}.smali", class.replace('.', "/")))
}

pub fn locate_class(decoded: &DecodedApk, class: &str) -> Result<PathBuf> {
    let relative = class_file(class);

    decoded
        .smali_roots()
        .par_iter()
        .map(|root| root.join(&relative))
        .find_first(|candidate| candidate.is_file())
        .ok_or_else(|| PatchError::EntryPointNotFound {
            class: class.to_string(),
            hint: closest_class(decoded, class),
        })
}

/// Best fuzzy match for `class` among every smali class in the tree.
fn closest_class(decoded: &DecodedApk, class: &str) -> Option<String> {
    let simple = class.rsplit('.').next().unwrap_or(class);
    let matcher = SkimMatcherV2::default();

    let classes: Vec<String> = decoded
        .smali_roots()
        .par_iter()
        .flat_map_iter(|root| {
            let mut found = Vec::new();
            collect_classes(root, root, &mut found);
            found
        })
        .collect();

    classes
        .into_iter()
        .filter_map(|candidate| {
            let candidate_simple = candidate.rsplit('.').next().unwrap_or(&candidate);
            matcher
                .fuzzy_match(candidate_simple, simple)
                .map(|score| (score, candidate))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, candidate)| candidate)
}

fn collect_classes(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            collect_classes(root, &path, out);
        } else if path.extension().is_some_and(|ext| ext == "smali") {
            if let Ok(rel) = path.with_extension("").strip_prefix(root) {
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(".");
                out.push(name);
            }
        }
    }
}

/// Places the gadget (and the optional autoload script) in the tree and
/// adds the loader to the entry class. The smali edit happens last, so an
/// interrupted apply never looks patched.
pub fn apply(
    plan: &InjectionPlan,
    decoded: &mut DecodedApk,
    gadget: &GadgetAsset,
    autoload_script: Option<&Path>,
) -> Result<ApplyOutcome> {
    if plan.already_patched {
        info!("{} already loads the gadget, leaving it alone", plan.entry_class);
        return Ok(ApplyOutcome::AlreadyPatched);
    }

    let config = autoload_script
        .map(|_| serde_json::to_string_pretty(&GadgetConfig::autoload()))
        .transpose()
        .map_err(|e| PatchError::Other(e.into()))?;

    let mut libraries = Vec::new();

    for lib_dir in decoded.lib_dirs_for(gadget.architecture) {
        fs::create_dir_all(&lib_dir).map_err(|e| PatchError::from_io(&lib_dir, e))?;

        let target = lib_dir.join(GADGET_FILE);
        fs::copy(&gadget.path, &target).map_err(|e| PatchError::from_io(&target, e))?;
        info!("Copied gadget to {}", target.display());
        libraries.push(target);

        if let (Some(script), Some(config)) = (autoload_script, &config) {
            let script_target = lib_dir.join(AUTOLOAD_SCRIPT_FILE);
            fs::copy(script, &script_target).map_err(|e| PatchError::from_io(&script_target, e))?;
            write_atomic(&lib_dir.join(GADGET_CONFIG_FILE), config)?;
            info!("Autoload script installed as {}", script_target.display());
        }
    }

    let source = fs::read_to_string(&plan.smali_path)
        .map_err(|e| PatchError::from_io(&plan.smali_path, e))?;
    let patched = smali::inject_loader(&source, plan.strategy);

    let loaders = smali::count_loaders(&patched);
    if loaders != 1 {
        return Err(PatchError::Other(anyhow::anyhow!(
            "{} would load the gadget {loaders} times after patching",
            plan.entry_class
        )));
    }

    write_atomic(&plan.smali_path, patched)?;
    info!("Injected gadget loader into {}", plan.entry_class);

    decoded.rescan_native_libs()?;

    Ok(ApplyOutcome::Applied { libraries })
}
