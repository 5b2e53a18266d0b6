//! Blob store: scoped binary storage with upload progress.
//!
//! The trait mirrors the external object-storage contract (resumable
//! put-with-progress, address-for-read, delete-by-path); the bundled
//! implementation writes beneath a local root directory. Progress is
//! reported as a monotonically non-decreasing percentage; callers must
//! wait for `put` to return before asking for the read address.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Upload chunk size; one progress report per chunk written.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Receives upload progress as a percentage in `0..=100`.
pub trait UploadProgress: Send + Sync {
    fn report(&self, percent: u8);
}

/// No-op reporter when progress is not displayed.
pub struct NoProgress;

impl UploadProgress for NoProgress {
    fn report(&self, _percent: u8) {}
}

/// Human-friendly progress on stderr: "upload 42%".
pub struct StderrProgress;

impl UploadProgress for StderrProgress {
    fn report(&self, percent: u8) {
        let _ = write!(std::io::stderr().lock(), "\rupload {}%", percent);
        let _ = std::io::stderr().lock().flush();
    }
}

/// Abstract blob backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path`, reporting progress until completion.
    async fn put(&self, path: &str, bytes: &[u8], progress: &dyn UploadProgress) -> Result<()>;

    /// Address a completed upload for reading.
    async fn address_for_read(&self, path: &str) -> Result<String>;

    /// Delete the blob at `path`.
    async fn delete(&self, path: &str) -> Result<()>;
}

// ============ Path convention ============

/// `users/{uid}/documents/{timestamp}-{filename}`
pub fn personal_document_path(uid: &str, file_name: &str, ts_ms: i64) -> String {
    format!(
        "users/{}/documents/{}-{}",
        uid,
        ts_ms,
        sanitize_file_name(file_name)
    )
}

/// `users/{uid}/chats/{chat_id}/documents/{timestamp}-{filename}`
pub fn team_document_path(uid: &str, chat_id: &str, file_name: &str, ts_ms: i64) -> String {
    format!(
        "users/{}/chats/{}/documents/{}-{}",
        uid,
        chat_id,
        ts_ms,
        sanitize_file_name(file_name)
    )
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

// ============ Local filesystem backend ============

/// Blob store rooted at a local directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a store path, refusing absolute paths and traversal.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(Error::Validation(format!("invalid blob path: {}", path)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], progress: &dyn UploadProgress) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&target).await?;
        let total = bytes.len();
        let mut written = 0usize;
        for chunk in bytes.chunks(UPLOAD_CHUNK_BYTES) {
            tokio::io::AsyncWriteExt::write_all(&mut file, chunk).await?;
            written += chunk.len();
            progress.report(((written * 100) / total.max(1)) as u8);
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        // An empty payload still completes.
        if total == 0 {
            progress.report(100);
        }
        Ok(())
    }

    async fn address_for_read(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        if !tokio::fs::try_exists(&target).await? {
            return Err(Error::Persistence(format!("blob not found: {}", path)));
        }
        Ok(target.display().to_string())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingProgress(Mutex<Vec<u8>>);

    impl UploadProgress for RecordingProgress {
        fn report(&self, percent: u8) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[tokio::test]
    async fn put_reports_monotone_progress_ending_at_100() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path());
        let progress = RecordingProgress(Mutex::new(Vec::new()));

        let bytes = vec![7u8; UPLOAD_CHUNK_BYTES * 3 + 17];
        store
            .put("users/u1/documents/1-big.pdf", &bytes, &progress)
            .await
            .unwrap();

        let reports = progress.0.lock().unwrap().clone();
        assert!(!reports.is_empty());
        assert!(reports.windows(2).all(|w| w[0] <= w[1]), "{:?}", reports);
        assert_eq!(*reports.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn put_then_read_then_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path());

        store
            .put("users/u1/documents/2-a.pdf", b"data", &NoProgress)
            .await
            .unwrap();
        let addr = store.address_for_read("users/u1/documents/2-a.pdf").await.unwrap();
        assert_eq!(std::fs::read(&addr).unwrap(), b"data");

        store.delete("users/u1/documents/2-a.pdf").await.unwrap();
        assert!(store.address_for_read("users/u1/documents/2-a.pdf").await.is_err());
    }

    #[tokio::test]
    async fn traversal_paths_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path());
        let err = store.put("../evil", b"x", &NoProgress).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.address_for_read("/etc/passwd").await.is_err());
    }

    #[test]
    fn path_convention() {
        assert_eq!(
            personal_document_path("u1", "report.pdf", 1700000000000),
            "users/u1/documents/1700000000000-report.pdf"
        );
        assert_eq!(
            team_document_path("u1", "c9", "a/b.pdf", 5),
            "users/u1/chats/c9/documents/5-a_b.pdf"
        );
    }
}
