//! Temporary files for operators that spill to disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fq_common::{FqError, Result};

static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);

/// A spill file path owned by one operator; the file is removed on drop.
#[derive(Debug)]
pub(crate) struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    /// Reserves a unique path `{dir}/{prefix}_{nanos}_{seq}.{ext}`, creating `dir`.
    pub(crate) fn create(dir: &Path, prefix: &str, ext: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| FqError::Execution(format!("clock error: {e}")))?
            .as_nanos();
        let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            path: dir.join(format!("{prefix}_{suffix}_{seq:06}.{ext}")),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_file_is_removed_on_drop() {
        let dir = std::env::temp_dir().join("fq_spill_test");
        let spill = SpillFile::create(&dir, "t", "bin").expect("create");
        fs::write(spill.path(), b"x").expect("write");
        let path = spill.path().to_path_buf();
        assert!(path.exists());
        drop(spill);
        assert!(!path.exists());
    }
}
