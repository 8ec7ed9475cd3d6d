//! # Upload Cursor
//!
//! Persisted read position into the legacy CSV log. Stored next to the CSV
//! as a small JSON document carrying exactly two fields:
//!
//! ```json
//! {"offset":1234,"line":17}
//! ```
//!
//! A missing or malformed cursor file means "start from the beginning".

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::error::Result;

/// Cursor side-file name, placed next to the CSV log
pub const CURSOR_FILE_NAME: &str = "upload.cursor";

/// How far the uploader has consumed the CSV log in the current epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    /// Byte offset of the next unconsumed row
    #[serde(rename = "offset", default)]
    pub byte_offset: u64,

    /// Rows consumed so far
    #[serde(rename = "line", default)]
    pub line_count: u32,
}

impl UploadCursor {
    pub fn new(byte_offset: u64, line_count: u32) -> Self {
        Self {
            byte_offset,
            line_count,
        }
    }

    /// Resets to zero when the stored offset lies past the end of the file.
    ///
    /// Handles external truncation or rotation of the CSV.
    pub fn clamp_to(self, file_size: u64) -> Self {
        if self.byte_offset > file_size {
            Self::default()
        } else {
            self
        }
    }
}

/// Cursor path for a CSV log: `upload.cursor` in the same directory.
pub fn cursor_path_for(csv_path: &Path) -> PathBuf {
    csv_path.with_file_name(CURSOR_FILE_NAME)
}

/// Loads the cursor. Caller must hold the storage lock.
///
/// Missing or malformed files yield the zero cursor.
pub async fn load(path: &Path) -> Result<UploadCursor> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(UploadCursor::default()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<UploadCursor>(&raw) {
        Ok(cursor) => Ok(cursor),
        Err(e) => {
            warn!("Ignoring malformed cursor {}: {}", path.display(), e);
            Ok(UploadCursor::default())
        }
    }
}

/// Persists the cursor via temp file + rename. Caller must hold the storage lock.
pub async fn persist(path: &Path, cursor: UploadCursor) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec(&cursor)?;
    fs::write(&tmp_path, bytes).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Deletes the cursor file. Returns whether one existed.
pub async fn remove(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&UploadCursor::new(1234, 17)).unwrap();
        assert_eq!(json, r#"{"offset":1234,"line":17}"#);
    }

    #[test]
    fn test_clamp_resets_past_eof() {
        assert_eq!(UploadCursor::new(500, 9).clamp_to(100), UploadCursor::default());
        assert_eq!(UploadCursor::new(100, 9).clamp_to(100), UploadCursor::new(100, 9));
    }

    #[test]
    fn test_cursor_path_is_adjacent() {
        assert_eq!(
            cursor_path_for(Path::new("/sd/logs.csv")),
            PathBuf::from("/sd/upload.cursor")
        );
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CURSOR_FILE_NAME);

        persist(&path, UploadCursor::new(42, 3)).await.unwrap();
        assert_eq!(load(&path).await.unwrap(), UploadCursor::new(42, 3));
        assert!(!path.with_extension("tmp").exists());

        persist(&path, UploadCursor::new(7, 1)).await.unwrap();
        assert_eq!(load(&path).await.unwrap(), UploadCursor::new(7, 1));
    }

    #[tokio::test]
    async fn test_missing_or_malformed_is_zero() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CURSOR_FILE_NAME);
        assert_eq!(load(&path).await.unwrap(), UploadCursor::default());

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load(&path).await.unwrap(), UploadCursor::default());

        std::fs::write(&path, r#"{"offset":9}"#).unwrap();
        assert_eq!(load(&path).await.unwrap(), UploadCursor::new(9, 0));
    }

    #[tokio::test]
    async fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CURSOR_FILE_NAME);
        assert!(!remove(&path).await.unwrap());
        persist(&path, UploadCursor::new(1, 1)).await.unwrap();
        assert!(remove(&path).await.unwrap());
        assert!(!path.exists());
    }
}
