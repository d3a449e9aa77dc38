use crate::gadgetpatch::error::{PatchError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// A source or output APK on disk, checked to be a readable archive.
#[derive(Debug, Clone)]
pub struct ApkUtils {
    apk_path: PathBuf,
}

impl ApkUtils {
    pub fn new(apk_path: PathBuf) -> Result<Self> {
        if !apk_path.exists() {
            return Err(PatchError::InvalidInput(format!(
                "{}: path not found or insufficient permissions",
                apk_path.display()
            )));
        }

        if !apk_path.is_file() {
            return Err(PatchError::InvalidInput(format!(
                "{}: expected a file, found a directory",
                apk_path.display()
            )));
        }

        let is_apk = apk_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"));

        if !is_apk {
            let found = apk_path
                .extension()
                .map(|ext| format!("a .{} file", ext.to_string_lossy()))
                .unwrap_or_else(|| "a file without extension".to_string());

            return Err(PatchError::InvalidInput(format!(
                "expected an APK file, found {found}"
            )));
        }

        let utils = Self { apk_path };
        utils.archive()?;

        Ok(utils)
    }

    pub fn path(&self) -> &Path {
        &self.apk_path
    }

    fn archive(&self) -> Result<ZipArchive<File>> {
        let file = File::open(&self.apk_path).map_err(|e| PatchError::from_io(&self.apk_path, e))?;

        ZipArchive::new(file).map_err(|e| {
            PatchError::InvalidInput(format!(
                "{} is not a valid APK archive: {e}",
                self.apk_path.display()
            ))
        })
    }

    /// `lib/<abi>/<name>.so` entries, sorted.
    pub fn native_lib_entries(&self) -> Result<Vec<String>> {
        let archive = self.archive()?;
        let mut libs: Vec<String> = archive
            .file_names()
            .filter(|name| name.starts_with("lib/") && name.ends_with(".so"))
            .map(str::to_string)
            .collect();
        libs.sort();

        Ok(libs)
    }
}
