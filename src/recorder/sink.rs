//! Attenuation table file backends.
//!
//! A [`TableSink`] mirrors the in-memory [`AttenuationTable`] into a file that
//! other processes may read while it is being written. Two backends exist:
//!
//! - [`MmapTableSink`]: memory-mapped binary table (always available)
//! - `Hdf5TableSink`: two resizable HDF5 datasets (feature `storage_hdf5`)
//!
//! # Binary table layout
//! ```text
//! [64-byte header] [row 0] [row 1] ...
//!
//! Header:
//!   magic: u64        (0x50_46_43_41_54_54_4E_01, "PFCATTN\x01")
//!   columns: u64      (always 2)
//!   length: u64       (rows published to readers)
//!   capacity: u64     (rows allocated in the file)
//!   padding: [u8; 32]
//!
//! Row: adjustment: i64, attenuation: i64 (little endian)
//! ```
//!
//! Readers must only trust `length` rows. Rows past `length` are zero.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use super::table::AttenuationTable;
use crate::error::StorageError;

pub const MAGIC: u64 = 0x50_46_43_41_54_54_4E_01;
pub const HEADER_SIZE: usize = 64;
pub const ROW_SIZE: usize = 16;
const COLUMNS: u64 = 2;
const INITIAL_CAPACITY: usize = 128;

const COLUMNS_OFFSET: usize = 8;
const LENGTH_OFFSET: usize = 16;
const CAPACITY_OFFSET: usize = 24;

/// File side of an open attenuation table.
pub trait TableSink: Send {
    /// File this sink writes to
    fn path(&self) -> &Path;

    /// Store one row, growing the file (zero filled) to `index + 1` rows if
    /// needed. Never shrinks.
    fn write(&mut self, index: usize, adjustment: i64, attenuation: i64)
        -> Result<(), StorageError>;

    fn flush(&mut self) -> Result<(), StorageError>;
}

/// Which file format new output files use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableBackend {
    /// [`MmapTableSink`]
    Mmap,
    /// `Hdf5TableSink`, needs the `storage_hdf5` feature
    Hdf5,
}

impl TableBackend {
    /// Backend for a configuration name (`"mmap"` or `"hdf5"`)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mmap" => Some(TableBackend::Mmap),
            "hdf5" => Some(TableBackend::Hdf5),
            _ => None,
        }
    }

    /// Create a fresh table file at `path`, replacing any existing file.
    pub fn create(self, path: &Path) -> Result<Box<dyn TableSink>, StorageError> {
        match self {
            TableBackend::Mmap => Ok(Box::new(MmapTableSink::create(path)?)),
            #[cfg(feature = "storage_hdf5")]
            TableBackend::Hdf5 => Ok(Box::new(super::hdf5::Hdf5TableSink::create(path)?)),
            #[cfg(not(feature = "storage_hdf5"))]
            TableBackend::Hdf5 => Err(StorageError::BackendNotEnabled(
                "hdf5".to_string(),
                "storage_hdf5".to_string(),
            )),
        }
    }
}

/// Memory-mapped binary table.
pub struct MmapTableSink {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    capacity: usize,
    len: usize,
}

impl MmapTableSink {
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((HEADER_SIZE + INITIAL_CAPACITY * ROW_SIZE) as u64)?;

        let mut sink = Self {
            path: path.to_path_buf(),
            mmap: map(&file)?,
            file,
            capacity: INITIAL_CAPACITY,
            len: 0,
        };
        sink.put_u64(0, MAGIC);
        sink.put_u64(COLUMNS_OFFSET, COLUMNS);
        sink.put_u64(LENGTH_OFFSET, 0);
        sink.put_u64(CAPACITY_OFFSET, INITIAL_CAPACITY as u64);
        Ok(sink)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.mmap[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, offset: usize, value: i64) {
        self.mmap[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn publish_len(&mut self, len: usize) {
        self.len = len;
        self.put_u64(LENGTH_OFFSET, len as u64);
    }

    fn reserve(&mut self, rows: usize) -> Result<(), StorageError> {
        if rows <= self.capacity {
            return Ok(());
        }
        let doubled = self.capacity.saturating_mul(2);
        let capacity = if rows < doubled && file_size(doubled).is_some() {
            doubled
        } else {
            rows
        };
        let size = file_size(capacity).ok_or(StorageError::FrameOutOfRange(rows as u64))?;
        self.mmap.flush()?;
        self.file.set_len(size)?;
        self.mmap = map(&self.file)?;
        self.capacity = capacity;
        self.put_u64(CAPACITY_OFFSET, capacity as u64);
        tracing::debug!(path = %self.path.display(), capacity, "Grew attenuation table file");
        Ok(())
    }
}

impl TableSink for MmapTableSink {
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
        self.reserve(rows)?;
        let offset = HEADER_SIZE + index * ROW_SIZE;
        self.put_i64(offset, adjustment);
        self.put_i64(offset + 8, attenuation);
        // Row first, then the length readers trust
        if index >= self.len {
            self.publish_len(rows);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Bytes needed for `rows` rows, `None` if that does not fit in memory.
fn file_size(rows: usize) -> Option<u64> {
    let bytes = rows
        .checked_mul(ROW_SIZE)?
        .checked_add(HEADER_SIZE)
        .filter(|bytes| isize::try_from(*bytes).is_ok())?;
    u64::try_from(bytes).ok()
}

fn map(file: &File) -> Result<MmapMut, StorageError> {
    // SAFETY: the file is open read/write, sized before mapping, and only this
    // sink writes to it while it is open.
    #[allow(unsafe_code)]
    let mmap = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(mmap)
}

/// Read a binary attenuation table, e.g. from a live reader.
pub fn read_table(path: &Path) -> Result<AttenuationTable, StorageError> {
    let bytes = std::fs::read(path)?;
    let bad = || StorageError::BadHeader {
        path: path.to_path_buf(),
    };
    if bytes.len() < HEADER_SIZE {
        return Err(bad());
    }

    let word = |offset: usize| -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[offset..offset + 8]);
        buf
    };
    if u64::from_le_bytes(word(0)) != MAGIC || u64::from_le_bytes(word(COLUMNS_OFFSET)) != COLUMNS
    {
        return Err(bad());
    }
    let len = usize::try_from(u64::from_le_bytes(word(LENGTH_OFFSET))).map_err(|_| bad())?;
    match file_size(len) {
        Some(needed) if bytes.len() as u64 >= needed => {}
        _ => return Err(bad()),
    }

    let (adjustment, attenuation) = (0..len)
        .map(|i| {
            let offset = HEADER_SIZE + i * ROW_SIZE;
            (
                i64::from_le_bytes(word(offset)),
                i64::from_le_bytes(word(offset + 8)),
            )
        })
        .unzip();
    AttenuationTable::with_columns(adjustment, attenuation).ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let mut sink = MmapTableSink::create(&path).unwrap();
        sink.flush().unwrap();

        assert!(sink.is_empty());
        assert!(read_table(&path).unwrap().is_empty());
    }

    #[test]
    fn rows_survive_capacity_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let mut sink = MmapTableSink::create(&path).unwrap();

        sink.write(1, -2, 9).unwrap();
        sink.write(1000, 4, 5).unwrap();
        sink.flush().unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.len(), 1001);
        assert_eq!(table.get(0), Some((0, 0)));
        assert_eq!(table.get(1), Some((-2, 9)));
        assert_eq!(table.get(500), Some((0, 0)));
        assert_eq!(table.get(1000), Some((4, 5)));
    }

    #[test]
    fn earlier_rows_never_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrink.bin");
        let mut sink = MmapTableSink::create(&path).unwrap();
        sink.write(9, 1, 1).unwrap();
        sink.write(3, 2, 2).unwrap();
        assert_eq!(sink.len(), 10);
    }

    #[test]
    fn unaddressable_rows_leave_the_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        let mut sink = MmapTableSink::create(&path).unwrap();
        sink.write(0, 5, 6).unwrap();

        for index in [usize::MAX, usize::MAX / ROW_SIZE] {
            assert!(matches!(
                sink.write(index, 0, 1),
                Err(StorageError::FrameOutOfRange(_))
            ));
        }
        sink.flush().unwrap();
        let table = read_table(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0), Some((5, 6)));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.bin");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(matches!(
            read_table(&path),
            Err(StorageError::BadHeader { .. })
        ));
    }

    #[test]
    fn backend_names() {
        assert_eq!(TableBackend::from_name("mmap"), Some(TableBackend::Mmap));
        assert_eq!(TableBackend::from_name("hdf5"), Some(TableBackend::Hdf5));
        assert_eq!(TableBackend::from_name("csv"), None);
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn hdf5_backend_requires_feature() {
        let dir = tempfile::tempdir().unwrap();
        let result = TableBackend::Hdf5.create(&dir.path().join("t.h5"));
        assert!(matches!(result, Err(StorageError::BackendNotEnabled(..))));
    }
}
