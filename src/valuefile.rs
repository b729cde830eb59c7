//! Value-file path resolution and a small open-file cache used by the
//! segment reader while it walks a segment's sequences.
//!
//! Value files are treated as byte-addressable append-only blobs; their
//! physical layout is an external collaborator. This module
//! only owns the deterministic path function and the lifetime of handles
//! opened during one read generation.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::ReaderError;

/// Deterministic mapping from a value-file id to its filesystem path.
///
/// Spreads files across 1000 subdirectories (by `value_file_id % 1000`) so a
/// single directory never accumulates an unbounded number of entries.
pub fn value_file_path(repository_root: &Path, value_file_id: i64) -> PathBuf {
    let bucket = (value_file_id.rem_euclid(1000)) as u64;
    repository_root
        .join(format!("{bucket:03}"))
        .join(format!("value_file_{value_file_id:020}"))
}

/// Scoped cache of open value-file handles for one read generation.
///
/// Files are opened lazily on first touch and kept until this guard is
/// dropped, mirroring the reference generator's `open_value_files` dict
/// that is closed in full once the stream ends -- here it happens for free
/// via `Drop`, including on abnormal termination (an early return or a
/// panic unwinding through the stream).
pub struct OpenValueFiles {
    repository_root: PathBuf,
    handles: HashMap<i64, std::fs::File>,
}

impl OpenValueFiles {
    pub fn new(repository_root: impl Into<PathBuf>) -> Self {
        Self {
            repository_root: repository_root.into(),
            handles: HashMap::new(),
        }
    }

    pub fn read(&mut self, value_file_id: i64, offset: i64, size: i64) -> Result<Vec<u8>, ReaderError> {
        if !self.handles.contains_key(&value_file_id) {
            let path = value_file_path(&self.repository_root, value_file_id);
            let file = std::fs::File::open(&path)?;
            self.handles.insert(value_file_id, file);
        }
        let file = self.handles.get_mut(&value_file_id).expect("just inserted");
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ReaderError::ShortRead {
                    expected: size as usize,
                    actual: 0,
                }
            } else {
                ReaderError::Io(e)
            }
        })?;
        Ok(buf)
    }
}
