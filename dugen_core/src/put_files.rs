use crate::handle::{DeclaringType, PutRecord};
use crate::strategy::sanitize_identifier;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PutFileError {
    /// The output directory or one of its per-type subdirectories could not be
    /// created.
    #[error("Failed to create PUT directory {path:?}: {reason}")]
    CreateDir { path: PathBuf, reason: String },

    #[error("Failed to write PUT file {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Outcome of writing a batch. Failures carry the index of the record in the
/// batch so the caller can retry exactly those.
#[derive(Debug, Default)]
pub struct WriteSummary {
    pub written: usize,
    pub failed: Vec<(usize, PutFileError)>,
}

impl WriteSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes emitted PUT bodies to `<root>/<type>/put_<md5>.put`.
///
/// File names are content-addressed, so an existing file already holds the
/// same body and is left alone.
#[derive(Debug, Clone)]
pub struct PutFileWriter {
    root: PathBuf,
}

impl PutFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PutFileError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PutFileError::CreateDir {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, declaring_type: &DeclaringType, body: &str) -> PathBuf {
        let digest = md5::compute(body.as_bytes());
        self.root
            .join(sanitize_identifier(declaring_type.as_str()))
            .join(format!("put_{:x}.put", digest))
    }

    /// Writes one record, returning `Some(path)` only when a new file was
    /// created. The body goes to a temp file in the same directory and is
    /// renamed into place, so a failed write never leaves a partial file
    /// under the content-addressed name.
    pub fn write(&self, record: &PutRecord) -> Result<Option<PathBuf>, PutFileError> {
        let path = self.path_for(&record.declaring_type, &record.body);
        if path.exists() {
            debug!(path = ?path, "PUT file already present");
            return Ok(None);
        }
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|e| PutFileError::CreateDir {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let write_err = |e: std::io::Error| PutFileError::Write {
            path: path.clone(),
            reason: e.to_string(),
        };
        let mut temp_file = NamedTempFile::new_in(dir).map_err(write_err)?;
        temp_file
            .write_all(record.body.as_bytes())
            .map_err(write_err)?;
        if !record.body.ends_with('\n') {
            temp_file.write_all(b"\n").map_err(write_err)?;
        }
        temp_file.persist(&path).map_err(|e| write_err(e.error))?;
        Ok(Some(path))
    }

    /// Writes every record of a batch, carrying on past failures.
    pub fn write_all(&self, records: &[PutRecord]) -> WriteSummary {
        let mut summary = WriteSummary::default();
        for (index, record) in records.iter().enumerate() {
            match self.write(record) {
                Ok(Some(_)) => summary.written += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to write PUT file");
                    summary.failed.push((index, e));
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{DuPair, FieldHandle, MethodHandle};
    use tempfile::tempdir;

    fn record(ty: &str, body: &str) -> PutRecord {
        let declaring_type = DeclaringType::from(ty);
        PutRecord {
            declaring_type: declaring_type.clone(),
            body: body.to_string(),
            pair: DuPair::new(
                FieldHandle::new(format!("{ty}.F"), declaring_type.clone()),
                MethodHandle::new(format!("{ty}.Set"), declaring_type.clone()),
                MethodHandle::new(format!("{ty}.Get"), declaring_type),
            )
            .unwrap(),
        }
    }

    #[test]
    fn files_land_under_sanitized_type_dir() {
        let dir = tempdir().unwrap();
        let writer = PutFileWriter::new(dir.path().join("puts")).unwrap();
        let path = writer
            .write(&record("Ns.Outer+Inner", "void put() {}"))
            .unwrap()
            .expect("first write creates the file");

        assert!(path.starts_with(dir.path().join("puts").join("Ns_Outer_Inner")));
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("put_") && file_name.ends_with(".put"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "void put() {}\n");
    }

    #[test]
    fn rewriting_same_body_is_a_noop() {
        let dir = tempdir().unwrap();
        let writer = PutFileWriter::new(dir.path()).unwrap();
        let records = vec![record("T", "body one"), record("T", "body two")];

        assert_eq!(writer.write_all(&records).written, 2);
        assert_eq!(writer.write_all(&records).written, 0);
        assert_eq!(fs::read_dir(dir.path().join("T")).unwrap().count(), 2);
    }

    #[test]
    fn unwritable_type_dir_does_not_stop_the_batch() {
        let dir = tempdir().unwrap();
        let writer = PutFileWriter::new(dir.path()).unwrap();
        // a plain file where the type directory should go
        fs::write(dir.path().join("Blocked"), "").unwrap();
        let records = vec![
            record("A", "body a"),
            record("Blocked", "body blocked"),
            record("B", "body b"),
        ];

        let summary = writer.write_all(&records);
        assert_eq!(summary.written, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, 1);
        assert!(matches!(
            summary.failed[0].1,
            PutFileError::CreateDir { .. }
        ));
        assert!(!summary.is_complete());

        fs::remove_file(dir.path().join("Blocked")).unwrap();
        let retry = writer.write_all(&records);
        assert_eq!(retry.written, 1);
        assert!(retry.is_complete());
        assert_eq!(fs::read_dir(dir.path().join("Blocked")).unwrap().count(), 1);
    }

    #[test]
    fn written_file_holds_whole_body() {
        let dir = tempdir().unwrap();
        let writer = PutFileWriter::new(dir.path()).unwrap();
        writer.write(&record("T", "line one\nline two\n")).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path().join("T"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            fs::read_to_string(&entries[0]).unwrap(),
            "line one\nline two\n"
        );
    }

    #[test]
    fn same_body_on_two_types_gives_two_files() {
        let dir = tempdir().unwrap();
        let writer = PutFileWriter::new(dir.path()).unwrap();
        let a = writer.path_for(&"A".into(), "shared");
        let b = writer.path_for(&"B".into(), "shared");
        assert_ne!(a, b);
        assert_eq!(a.file_name(), b.file_name());
    }
}
