//! Read-only whole-file memory mapping.
//!
//! The mapping is owned by the handle and released on drop. Reads copy out
//! of the mapped slice, so record access never aliases packed structs.

use crate::error::{DataError, DataResult};
use crate::record::Record;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

#[derive(Debug)]
pub struct MappedFile {
    path: String,
    mmap: Mmap,
}

impl MappedFile {
    /// Map `path` read-only and verify it holds a whole number of `R`
    /// records, at least one.
    pub fn open<R: Record>(path: &Path) -> DataResult<Self> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(|e| DataError::io(&display, e))?;
        // read-only map; shared safely across threads
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DataError::io(&display, e))?;
        if mmap.len() == 0 {
            return Err(DataError::layout(&display, "binary dataset is empty"));
        }
        if mmap.len() % R::SIZE != 0 {
            return Err(DataError::layout(
                &display,
                format!(
                    "file size {} is not a multiple of record size {}",
                    mmap.len(),
                    R::SIZE
                ),
            ));
        }
        Ok(MappedFile { path: display, mmap })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn record_count<R: Record>(&self) -> usize {
        self.mmap.len() / R::SIZE
    }

    pub fn record_bytes<R: Record>(&self, index: usize) -> &[u8] {
        let start = index * R::SIZE;
        &self.mmap[start..start + R::SIZE]
    }

    /// O(1) key extraction at `index`.
    pub fn key_at<R: Record>(&self, index: usize) -> i64 {
        R::key_of(self.record_bytes::<R>(index))
    }

    pub fn record_at<R: Record>(&self, index: usize) -> R {
        R::from_bytes(self.record_bytes::<R>(index))
    }
}
