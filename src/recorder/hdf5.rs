//! HDF5 attenuation table backend.
//!
//! Writes two chunked, unlimited `i64` datasets (`adjustment` and
//! `attenuation`) using the latest file format so single-writer/multi-reader
//! consumers can follow the file while frames arrive.

use std::path::{Path, PathBuf};

use hdf5::{Dataset, File};

use super::sink::TableSink;
use crate::error::StorageError;
use crate::protocol::{ADJUSTMENT_KEY, ATTENUATION_KEY};

const CHUNK_ROWS: usize = 128;

/// Two unlimited `i64` datasets, `adjustment` and `attenuation`.
pub struct Hdf5TableSink {
    path: PathBuf,
    file: File,
    adjustment: Dataset,
    attenuation: Dataset,
    len: usize,
}

impl Hdf5TableSink {
    /// Create (or truncate) the file and both datasets.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = File::with_options()
            .with_fapl(|p| p.libver_latest())
            .create(path)?;

        let adjustment = file
            .new_dataset::<i64>()
            .chunk(CHUNK_ROWS)
            .shape(0..)
            .create(ADJUSTMENT_KEY)?;
        let attenuation = file
            .new_dataset::<i64>()
            .chunk(CHUNK_ROWS)
            .shape(0..)
            .create(ATTENUATION_KEY)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            adjustment,
            attenuation,
            len: 0,
        })
    }
}

impl TableSink for Hdf5TableSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write(
        &mut self,
        index: usize,
        adjustment: i64,
        attenuation: i64,
    ) -> Result<(), StorageError> {
        let rows = index
            .checked_add(1)
            .ok_or(StorageError::FrameOutOfRange(index as u64))?;
        if rows > self.len {
            self.adjustment.resize(rows)?;
            self.attenuation.resize(rows)?;
            self.len = rows;
        }
        self.adjustment.write_slice(&[adjustment], index..rows)?;
        self.attenuation.write_slice(&[attenuation], index..rows)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        Ok(())
    }
}
