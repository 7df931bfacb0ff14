//! The control sidecar: persistent download state for resuming.
//!
//! The control file lives next to the output file as `"{target}.paradl"`
//! and is serialized to disk as pretty JSON so crash recovery can pick up
//! partially completed downloads.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;
use crate::segment::Segment;

/// The only record version this build understands. Files carrying any
/// other version are treated as absent.
pub const CONTROL_VERSION: &str = "1.0";

/// Extension appended to the target path to form the control file path.
pub const CONTROL_SUFFIX: &str = ".paradl";

/// Serialized state of a download operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRecord {
    pub version: String,
    /// Source URLs in rotation order.
    pub urls: Vec<String>,
    /// Basename of the output file.
    pub filename: String,
    pub output_path: String,
    pub total_size: u64,
    /// All segments; array order defines segment indices.
    pub segments: Vec<Segment>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds, refreshed on every save.
    pub last_modified: i64,
}

/// Persistence adapter for one download's control file.
#[derive(Debug)]
pub struct ControlStore {
    path: PathBuf,
}

impl ControlStore {
    /// Builds the store for a target output path: `"{target}.paradl"`.
    pub fn for_target(target: &Path) -> Self {
        let mut os = target.as_os_str().to_os_string();
        os.push(CONTROL_SUFFIX);
        Self {
            path: PathBuf::from(os),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the record atomically: serialize to a sibling temp file, then
    /// rename into place so readers never observe a half-written file.
    pub async fn save(&self, record: &ControlRecord) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(record)?;
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Reads the record back, returning `None` on any error: a missing
    /// file, unparsable JSON, or an unrecognized version.
    pub async fn load(&self) -> Option<ControlRecord> {
        let json = fs::read_to_string(&self.path).await.ok()?;
        let record: ControlRecord = match serde_json::from_str(&json) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "ignoring unreadable control file");
                return None;
            }
        };
        if record.version != CONTROL_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                version = %record.version,
                "ignoring control file with unknown version"
            );
            return None;
        }
        Some(record)
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Removes the control file. A missing file is not an error.
    pub async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentStatus;
    use tempfile::tempdir;

    fn sample_record(output_path: &Path) -> ControlRecord {
        let mut partial = Segment::new(1, 11, 20);
        partial.downloaded_bytes = 4;
        partial.status = SegmentStatus::Downloading;
        ControlRecord {
            version: CONTROL_VERSION.to_string(),
            urls: vec!["http://example.com/file.bin".into()],
            filename: "file.bin".into(),
            output_path: output_path.to_string_lossy().into_owned(),
            total_size: 21,
            segments: vec![
                Segment {
                    index: 0,
                    start_byte: 0,
                    end_byte: 10,
                    downloaded_bytes: 11,
                    status: SegmentStatus::Completed,
                },
                partial,
            ],
            created_at: 1_700_000_000_000,
            last_modified: 1_700_000_060_000,
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trips_segments() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::for_target(&target);

        let record = sample_record(&target);
        store.save(&record).await.unwrap();
        assert!(store.exists().await);
        assert!(store.path().to_string_lossy().ends_with("file.bin.paradl"));

        let loaded = store.load().await.expect("record should load");
        assert_eq!(loaded.total_size, 21);
        assert_eq!(loaded.segments.len(), 2);
        for (saved, loaded) in record.segments.iter().zip(&loaded.segments) {
            assert_eq!(saved.index, loaded.index);
            assert_eq!(saved.start_byte, loaded.start_byte);
            assert_eq!(saved.end_byte, loaded.end_byte);
            assert_eq!(saved.downloaded_bytes, loaded.downloaded_bytes);
        }
    }

    #[tokio::test]
    async fn wire_format_uses_camel_case_fields() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::for_target(&target);
        store.save(&sample_record(&target)).await.unwrap();

        let json = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(json.contains("\"totalSize\""));
        assert!(json.contains("\"startByte\""));
        assert!(json.contains("\"downloadedBytes\""));
        assert!(json.contains("\"lastModified\""));
        assert!(json.contains("\"downloading\""));
    }

    #[tokio::test]
    async fn load_ignores_unknown_version() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::for_target(&target);

        let mut record = sample_record(&target);
        record.version = "2.0".into();
        store.save(&record).await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn load_ignores_corrupt_json() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::for_target(&target);

        tokio::fs::write(store.path(), b"{ not json").await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn load_tolerates_unknown_fields() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file.bin");
        let store = ControlStore::for_target(&target);

        let json = r#"{
            "version": "1.0",
            "urls": ["http://example.com/f"],
            "filename": "f",
            "outputPath": "/tmp/f",
            "totalSize": 10,
            "segments": [
                {"index": 0, "startByte": 0, "endByte": 9, "downloadedBytes": 0, "status": "pending", "extra": true}
            ],
            "createdAt": 0,
            "lastModified": 0,
            "futureField": "ignored"
        }"#;
        tokio::fs::write(store.path(), json).await.unwrap();
        assert!(store.load().await.is_some());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ControlStore::for_target(&dir.path().join("file.bin"));
        store.delete().await.unwrap();
        store.save(&sample_record(&dir.path().join("file.bin"))).await.unwrap();
        store.delete().await.unwrap();
        assert!(!store.exists().await);
    }
}
