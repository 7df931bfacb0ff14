//! Positional file writing with up-front allocation.
//!
//! The writer owns the single read-write handle for a download's output
//! file. It knows nothing about segments; callers pass absolute byte
//! offsets and the chunk manager is responsible for keeping them disjoint.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::config::FileAllocation;
use crate::error::Result;

const ZERO_FILL_BUF: usize = 1024 * 1024;

/// A single output file opened for random-access writes.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl FileWriter {
    /// Opens (or creates) `path` for read-write and applies the allocation
    /// strategy. Existing file contents are preserved so resumed downloads
    /// keep the bytes already written.
    pub async fn open(path: &Path, size: u64, allocation: FileAllocation) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;

        match allocation {
            FileAllocation::None => {}
            // No portable block-reservation call is available here, so
            // `Falloc` takes its documented fallback and sizes the file.
            FileAllocation::Trunc | FileAllocation::Falloc => {
                file.set_len(size).await?;
            }
            FileAllocation::Prealloc => {
                file.set_len(size).await?;
                zero_fill(&mut file, size).await?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `bytes` at the absolute `position`.
    pub async fn write_at(&mut self, position: u64, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.seek(SeekFrom::Start(position)).await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    /// Flushes and releases the handle. A second call is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Reports whether `path` exists and how large it is.
    pub async fn probe(path: &Path) -> (bool, u64) {
        match fs::metadata(path).await {
            Ok(meta) => (true, meta.len()),
            Err(_) => (false, 0),
        }
    }
}

async fn zero_fill(file: &mut File, size: u64) -> Result<()> {
    let buf = vec![0u8; ZERO_FILL_BUF.min(size.max(1) as usize)];
    file.seek(SeekFrom::Start(0)).await?;
    let mut remaining = size;
    while remaining > 0 {
        let n = (buf.len() as u64).min(remaining) as usize;
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    Ok(())
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "file writer is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_land_at_their_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut writer = FileWriter::open(&path, 10, FileAllocation::Trunc)
            .await
            .unwrap();
        writer.write_at(5, b"World").await.unwrap();
        writer.write_at(0, b"Hello").await.unwrap();
        writer.close().await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&content, b"HelloWorld");
    }

    #[tokio::test]
    async fn trunc_sets_the_file_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sparse.bin");

        let mut writer = FileWriter::open(&path, 4096, FileAllocation::Trunc)
            .await
            .unwrap();
        writer.close().await.unwrap();

        let (exists, size) = FileWriter::probe(&path).await;
        assert!(exists);
        assert_eq!(size, 4096);
    }

    #[tokio::test]
    async fn prealloc_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zeroed.bin");

        let mut writer = FileWriter::open(&path, 2048, FileAllocation::Prealloc)
            .await
            .unwrap();
        writer.close().await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content.len(), 2048);
        assert!(content.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn open_preserves_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.bin");
        tokio::fs::write(&path, b"already here").await.unwrap();

        let mut writer = FileWriter::open(&path, 12, FileAllocation::Trunc)
            .await
            .unwrap();
        writer.close().await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&content, b"already here");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("closed.bin");

        let mut writer = FileWriter::open(&path, 4, FileAllocation::None)
            .await
            .unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.write_at(0, b"nope").await.is_err());
    }

    #[tokio::test]
    async fn open_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c/out.bin");

        let mut writer = FileWriter::open(&path, 1, FileAllocation::Trunc)
            .await
            .unwrap();
        writer.close().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn probe_missing_file() {
        let dir = tempdir().unwrap();
        let (exists, size) = FileWriter::probe(&dir.path().join("nope")).await;
        assert!(!exists);
        assert_eq!(size, 0);
    }
}
