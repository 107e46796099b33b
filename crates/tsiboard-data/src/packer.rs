//! CSV → binary packing and binary → vector reading.
//!
//! The packer preserves the record's fixed field order, buffers writes, and
//! skips malformed lines with a warning so a long historical file with a
//! few bad rows still packs.

use crate::error::{DataError, DataResult};
use crate::record::Record;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

const WRITE_BUFFER_RECORDS: usize = 1024;

/// Convert a CSV file into a binary channel file. Returns the number of
/// records written.
pub fn csv_to_binary<R: Record>(csv_path: &Path, bin_path: &Path) -> DataResult<usize> {
    let csv_display = csv_path.display().to_string();
    let bin_display = bin_path.display().to_string();

    let csv_file = File::open(csv_path).map_err(|e| DataError::io(&csv_display, e))?;
    let bin_file = File::create(bin_path).map_err(|e| DataError::io(&bin_display, e))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_RECORDS * R::SIZE, bin_file);

    let mut written = 0usize;
    for (i, line) in BufReader::new(csv_file).lines().enumerate() {
        let line_number = i + 1;
        let line = line.map_err(|e| DataError::io(&csv_display, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match R::from_csv(&line, line_number) {
            Ok(record) => {
                writer
                    .write_all(&record.to_bytes())
                    .map_err(|e| DataError::io(&bin_display, e))?;
                written += 1;
            }
            Err(e) => {
                warn!(line_number, error = %e, "skipping malformed csv line");
            }
        }
    }
    writer.flush().map_err(|e| DataError::io(&bin_display, e))?;
    info!(records = written, from = %csv_display, to = %bin_display, "csv packed to binary");
    Ok(written)
}

/// Read a whole binary channel file back into memory.
pub fn binary_to_vec<R: Record>(bin_path: &Path) -> DataResult<Vec<R>> {
    let display = bin_path.display().to_string();
    let mut file = File::open(bin_path).map_err(|e| DataError::io(&display, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| DataError::io(&display, e))?;
    if bytes.len() % R::SIZE != 0 {
        return Err(DataError::layout(
            &display,
            format!("file size {} is not a multiple of record size {}", bytes.len(), R::SIZE),
        ));
    }
    Ok(bytes.chunks_exact(R::SIZE).map(R::from_bytes).collect())
}

/// Write records to a binary channel file (test fixtures, re-packing).
pub fn vec_to_binary<R: Record>(records: &[R], bin_path: &Path) -> DataResult<()> {
    let display = bin_path.display().to_string();
    let file = File::create(bin_path).map_err(|e| DataError::io(&display, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        writer.write_all(&record.to_bytes()).map_err(|e| DataError::io(&display, e))?;
    }
    writer.flush().map_err(|e| DataError::io(&display, e))?;
    Ok(())
}
