use crate::gadgetpatch::error::{PatchError, Result};
use std::fs;
use std::path::Path;

pub mod string_buf;
pub mod writer;

/// Replaces `path` with `contents` through a sibling temp file, so readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| PatchError::InvalidInput(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    fs::write(&tmp, contents).map_err(|e| PatchError::from_io(&tmp, e))?;

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PatchError::from_io(path, e)
    })
}

/// Moves a file, falling back to copy + delete across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    fs::copy(from, to).map_err(|e| PatchError::from_io(to, e))?;
    fs::remove_file(from).map_err(|e| PatchError::from_io(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("AndroidManifest.xml");
        fs::write(&target, "old").unwrap();

        write_atomic(&target, "new").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn move_file_relocates() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.apk");
        let to = dir.path().join("b.apk");
        fs::write(&from, b"PK").unwrap();

        move_file(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"PK");
    }
}
