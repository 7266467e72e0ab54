//! Output file naming.
//!
//! The control system sets a directory (`FILE:PATH`) and a file name
//! (`FILE:NAME`); the recorder writes to `FILE:FULL_NAME`, their join. Before a
//! new file is created the directory is checked and, if a file of that name
//! already exists, a time suffix is added rather than overwriting it.

use chrono::{DateTime, Local, NaiveTime};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why no output file could be opened.
#[derive(Error, Debug, PartialEq)]
pub enum OutputPathError {
    #[error("Please enter a valid file path and name (path={path:?}, name={name:?})")]
    Empty { path: String, name: String },

    #[error("Path not found: parent of {0} does not exist")]
    ParentMissing(PathBuf),

    #[error("Failed to create directory {path}: {message}")]
    CreateDir { path: PathBuf, message: String },

    #[error("Failed to open output file {0}")]
    OpenFailed(PathBuf),
}

/// `path/name`, as published in `FILE:FULL_NAME`.
pub fn full_name(path: &str, name: &str) -> String {
    format!("{}/{}", path.trim_end_matches('/'), name)
}

/// Default output directory: `<parent>/test_<YYYY-MM-DD>`.
pub fn default_directory(parent: &Path, now: DateTime<Local>) -> PathBuf {
    parent.join(format!("test_{}", now.format("%Y-%m-%d")))
}

/// Append `-HHMMSS.ffffff` to the file stem, keeping the extension.
pub fn with_time_suffix(name: &str, time: NaiveTime) -> String {
    let suffix = time.format("%H%M%S%.6f");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{suffix}.{ext}"),
        _ => format!("{name}-{suffix}"),
    }
}

/// Validate the target directory and pick a file path that does not clobber
/// an existing file.
///
/// A missing directory is created when its parent exists.
pub fn prepare(path: &str, name: &str, now: DateTime<Local>) -> Result<PathBuf, OutputPathError> {
    if path.is_empty() || name.is_empty() {
        return Err(OutputPathError::Empty {
            path: path.to_string(),
            name: name.to_string(),
        });
    }

    let dir = Path::new(path);
    if !dir.is_dir() {
        let parent_exists = match dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
            _ => true,
        };
        if !parent_exists {
            return Err(OutputPathError::ParentMissing(dir.to_path_buf()));
        }
        tracing::info!(dir = %dir.display(), "Parent path exists, making new dir");
        std::fs::create_dir_all(dir).map_err(|e| OutputPathError::CreateDir {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
    }

    let candidate = PathBuf::from(full_name(path, name));
    if candidate.is_file() {
        let renamed = with_time_suffix(name, now.time());
        tracing::info!(
            existing = %candidate.display(),
            renamed = %renamed,
            "Output file exists, using time-suffixed name"
        );
        return Ok(PathBuf::from(full_name(path, &renamed)));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap()
    }

    #[test]
    fn joins_path_and_name() {
        assert_eq!(full_name("/data/run", "tmp.h5"), "/data/run/tmp.h5");
        assert_eq!(full_name("/data/run/", "tmp.h5"), "/data/run/tmp.h5");
    }

    #[test]
    fn default_directory_is_dated() {
        assert_eq!(
            default_directory(Path::new("/ioc"), noon()),
            PathBuf::from("/ioc/test_2024-03-09")
        );
    }

    #[test]
    fn time_suffix_keeps_extension() {
        let t = NaiveTime::from_hms_micro_opt(12, 30, 5, 42).unwrap();
        assert_eq!(with_time_suffix("tmp.h5", t), "tmp-123005.000042.h5");
        assert_eq!(with_time_suffix("frames", t), "frames-123005.000042");
    }

    #[test]
    fn empty_components_rejected() {
        assert!(matches!(
            prepare("", "tmp.h5", noon()),
            Err(OutputPathError::Empty { .. })
        ));
        assert!(matches!(
            prepare("/tmp", "", noon()),
            Err(OutputPathError::Empty { .. })
        ));
    }

    #[test]
    fn creates_missing_leaf_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("run1");
        let path = prepare(dir.to_str().unwrap(), "tmp.h5", noon()).unwrap();
        assert!(dir.is_dir());
        assert_eq!(path, dir.join("tmp.h5"));
    }

    #[test]
    fn missing_parent_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("a").join("b");
        assert!(matches!(
            prepare(dir.to_str().unwrap(), "tmp.h5", noon()),
            Err(OutputPathError::ParentMissing(_))
        ));
    }

    #[test]
    fn existing_file_gets_suffix() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("tmp.h5"), b"old").unwrap();
        let path = prepare(root.path().to_str().unwrap(), "tmp.h5", noon()).unwrap();
        assert_eq!(path, root.path().join("tmp-123005.000000.h5"));
    }
}
