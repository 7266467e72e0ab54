//! Frame recorder.
//!
//! Persists the per-frame `(adjustment, attenuation)` stream into one output
//! file at a time. The in-memory [`AttenuationTable`] is the source of truth
//! for lengths; the [`TableSink`] mirrors it to disk.
//!
//! - `open(path)` succeeds if `path` is already open or can be created, and
//!   fails (returns `false`) while a *different* file is open.
//! - `write(record)` grows the table to `frame_number + 1` if needed, then
//!   stores the values. Earlier frame numbers overwrite, gaps read as zero.
//! - `close()` flushes and releases the file; closing twice is a no-op.
//!
//! Frame numbers that cannot be addressed fail with
//! [`StorageError::FrameOutOfRange`] and leave the file untouched. The event
//! monitor bounds frame numbers before they get here.

pub mod path;
pub mod sink;
pub mod table;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use sink::{read_table, MmapTableSink, TableBackend, TableSink};
pub use table::AttenuationTable;

use crate::error::StorageError;
use crate::protocol::FrameRecord;

/// Recorder shared between the event demultiplexer, the synchronizer and
/// shutdown.
pub type SharedRecorder = Arc<tokio::sync::Mutex<FrameRecorder>>;

struct OutputFile {
    path: PathBuf,
    table: AttenuationTable,
    sink: Box<dyn TableSink>,
    frames_written: u64,
}

/// Owner of the one open output file.
pub struct FrameRecorder {
    backend: TableBackend,
    active: Option<OutputFile>,
}

impl FrameRecorder {
    pub fn new(backend: TableBackend) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    /// New recorder behind the shared async mutex
    pub fn shared(backend: TableBackend) -> SharedRecorder {
        Arc::new(tokio::sync::Mutex::new(Self::new(backend)))
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn open_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|f| f.path.as_path())
    }

    /// Frames written to the currently open file
    pub fn frames_written(&self) -> u64 {
        self.active.as_ref().map_or(0, |f| f.frames_written)
    }

    pub fn table(&self) -> Option<&AttenuationTable> {
        self.active.as_ref().map(|f| &f.table)
    }

    /// Open `path` for writing. See the module docs for the rules.
    pub fn open(&mut self, path: &Path) -> bool {
        if let Some(active) = &self.active {
            if active.path == path {
                return true;
            }
            tracing::warn!(
                open = %active.path.display(),
                requested = %path.display(),
                "Another file is already open and being written to"
            );
            return false;
        }

        match self.backend.create(path) {
            Ok(sink) => {
                tracing::info!(
                    path = %path.display(),
                    backend = ?self.backend,
                    "Opened output file"
                );
                self.active = Some(OutputFile {
                    path: path.to_path_buf(),
                    table: AttenuationTable::new(),
                    sink,
                    frames_written: 0,
                });
                true
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to create output file");
                false
            }
        }
    }

    /// Store one frame in the open file.
    pub fn write(&mut self, record: &FrameRecord) -> Result<(), StorageError> {
        let file = self.active.as_mut().ok_or(StorageError::NotOpen)?;

        let index = table::row_index(record.frame_number)?;
        file.sink.write(index, record.adjustment, record.attenuation)?;
        if let Some(rows) = file.table.write(record)? {
            tracing::trace!(path = %file.path.display(), rows, "Attenuation table grew");
        }
        file.frames_written += 1;
        Ok(())
    }

    /// Flush and release the open file. Returns `true` if a file was closed.
    pub fn close(&mut self) -> bool {
        let Some(mut file) = self.active.take() else {
            return false;
        };
        if let Err(e) = file.sink.flush() {
            tracing::error!(path = %file.path.display(), error = %e, "Failed closing file");
        }
        tracing::info!(
            path = %file.path.display(),
            frames = file.frames_written,
            rows = file.table.len(),
            "Closed output file"
        );
        true
    }
}

impl Drop for FrameRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
