use crate::gadgetpatch::error::{PatchError, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive};

/// Checks that stored (uncompressed) entries start on an aligned offset,
/// the way `zipalign -c` does.
#[derive(Debug, Clone)]
pub struct ZipAlign {
    apk_path: PathBuf,
    alignment: u64,
}

/// A stored entry whose data does not begin on the alignment boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Misaligned {
    pub name: String,
    pub data_start: u64,
}

impl ZipAlign {
    pub fn new(apk_path: PathBuf, alignment: u64) -> Self {
        Self {
            apk_path,
            alignment: alignment.max(1),
        }
    }

    pub fn verify(&self) -> Result<Vec<Misaligned>> {
        let file = File::open(&self.apk_path).map_err(|e| PatchError::from_io(&self.apk_path, e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| {
            PatchError::Signing(format!("{} is not a zip archive: {e}", self.apk_path.display()))
        })?;
        let mut bad = Vec::new();

        for i in 0..zip.len() {
            let entry = zip
                .by_index_raw(i)
                .map_err(|e| PatchError::Signing(format!("unreadable zip entry #{i}: {e}")))?;
            let data_start = entry.data_start();

            if entry.compression() != CompressionMethod::Stored {
                debug!("{:8} {} (OK - compressed)", data_start, entry.name());
                continue;
            }

            if data_start % self.alignment != 0 {
                debug!(
                    "{:8} {} (BAD - mod {} = {})",
                    data_start,
                    entry.name(),
                    self.alignment,
                    data_start % self.alignment
                );
                bad.push(Misaligned {
                    name: entry.name().to_string(),
                    data_start,
                });
            } else {
                debug!("{:8} {} (OK)", data_start, entry.name());
            }
        }

        Ok(bad)
    }
}
