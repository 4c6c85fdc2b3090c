//! Blob storage for uploaded media and derived thumbnails.
//!
//! Blobs are addressed by opaque handles of the form `<namespace>/<name>`,
//! where the name is generated server-side and never derived from a
//! client-supplied filename. [`LocalBlobStore`] maps handles onto files under
//! a root directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWriteExt};
use uuid::Uuid;
use vg_core::{Error, Result};

/// Top-level blob namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobNamespace {
    Videos,
    Thumbnails,
}

impl BlobNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Videos => "videos",
            Self::Thumbnails => "thumbnails",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "videos" => Some(Self::Videos),
            "thumbnails" => Some(Self::Thumbnails),
            _ => None,
        }
    }
}

/// A freshly written blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub handle: String,
    pub size: u64,
}

/// Readable, seekable blob contents.
pub trait BlobRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> BlobRead for T {}

/// An opened blob together with its total length.
pub struct OpenBlob {
    pub reader: Box<dyn BlobRead>,
    pub len: u64,
}

impl std::fmt::Debug for OpenBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenBlob").field("len", &self.len).finish()
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `reader` into a new blob. Fails with [`Error::Validation`] once
    /// more than `max_bytes` have been read; any partial blob is removed on
    /// every failure path, including the future being dropped.
    async fn save(
        &self,
        namespace: BlobNamespace,
        extension: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        max_bytes: u64,
    ) -> Result<StoredBlob>;

    /// Write an in-memory buffer as a new blob.
    async fn save_bytes(
        &self,
        namespace: BlobNamespace,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob>;

    /// Open a blob for reading. A handle that is well-formed but has no
    /// backing data is a [`Error::Storage`] integrity failure.
    async fn open(&self, handle: &str) -> Result<OpenBlob>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete(&self, handle: &str) -> Result<()>;

    /// Filesystem path for tools that need one, if this store has one.
    fn local_path(&self, handle: &str) -> Option<PathBuf>;
}

// ---------------------------------------------------------------------------
// LocalBlobStore
// ---------------------------------------------------------------------------

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (and create if needed) the namespace directories under `root`.
    pub async fn open_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for ns in [BlobNamespace::Videos, BlobNamespace::Thumbnails] {
            tokio::fs::create_dir_all(root.join(ns.as_str())).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a handle to a path, rejecting anything that is not exactly
    /// `<namespace>/<generated name>`.
    fn resolve(&self, handle: &str) -> Result<PathBuf> {
        let (ns, name) = handle
            .split_once('/')
            .ok_or_else(|| Error::not_found("blob", handle))?;
        let ns = BlobNamespace::parse(ns).ok_or_else(|| Error::not_found("blob", handle))?;
        let valid_name = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid_name {
            return Err(Error::not_found("blob", handle));
        }
        Ok(self.root.join(ns.as_str()).join(name))
    }

    fn new_handle(namespace: BlobNamespace, extension: &str) -> String {
        let ext: String = extension
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        let ext = if ext.is_empty() { "bin".to_string() } else { ext };
        format!("{}/{}.{ext}", namespace.as_str(), Uuid::new_v4())
    }
}

/// Removes the file at `path` on drop unless disarmed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), "Failed to remove partial blob: {e}");
                }
            } else {
                tracing::debug!(path = %self.path.display(), "Removed partial blob");
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn save(
        &self,
        namespace: BlobNamespace,
        extension: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        max_bytes: u64,
    ) -> Result<StoredBlob> {
        use tokio::io::AsyncReadExt;

        let handle = Self::new_handle(namespace, extension);
        let path = self.resolve(&handle)?;
        let guard = PartialFile::new(path.clone());

        let mut file = tokio::fs::File::create(&path).await?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut size: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            size += n as u64;
            if size > max_bytes {
                return Err(Error::Validation(format!(
                    "file exceeds the maximum upload size of {max_bytes} bytes"
                )));
            }
            file.write_all(&buf[..n]).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        guard.keep();

        Ok(StoredBlob { handle, size })
    }

    async fn save_bytes(
        &self,
        namespace: BlobNamespace,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob> {
        let handle = Self::new_handle(namespace, extension);
        let path = self.resolve(&handle)?;
        let guard = PartialFile::new(path.clone());
        tokio::fs::write(&path, bytes).await?;
        guard.keep();
        Ok(StoredBlob {
            handle,
            size: bytes.len() as u64,
        })
    }

    async fn open(&self, handle: &str) -> Result<OpenBlob> {
        let path = self.resolve(handle)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Storage(format!("blob {handle} unreadable at {}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::Storage(format!("blob {handle} metadata unavailable: {e}")))?
            .len();
        Ok(OpenBlob {
            reader: Box::new(file),
            len,
        })
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let path = self.resolve(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn local_path(&self, handle: &str) -> Option<PathBuf> {
        self.resolve(handle).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::AsyncReadExt;

    async fn store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::open_root(dir.path()).await.unwrap();
        (dir, store)
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn save_open_delete() {
        let (_dir, store) = store().await;
        let data = vec![7u8; 1000];
        let mut reader: &[u8] = &data;

        let blob = store
            .save(BlobNamespace::Videos, "mp4", &mut reader, 10_000)
            .await
            .unwrap();
        assert!(blob.handle.starts_with("videos/"));
        assert!(blob.handle.ends_with(".mp4"));
        assert_eq!(blob.size, 1000);

        let mut opened = store.open(&blob.handle).await.unwrap();
        assert_eq!(opened.len, 1000);
        let mut back = Vec::new();
        opened.reader.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, data);

        store.delete(&blob.handle).await.unwrap();
        assert_matches!(store.open(&blob.handle).await, Err(Error::Storage(_)));
        // deleting again is fine
        store.delete(&blob.handle).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_upload_leaves_no_file() {
        let (dir, store) = store().await;
        let data = vec![0u8; 2048];
        let mut reader: &[u8] = &data;

        let err = store
            .save(BlobNamespace::Videos, "mp4", &mut reader, 1024)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert_eq!(files_in(&dir.path().join("videos")), 0);
    }

    #[tokio::test]
    async fn failing_reader_leaves_no_file() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "client went away",
                )))
            }
        }

        let (dir, store) = store().await;
        let mut reader = Broken;
        let err = store
            .save(BlobNamespace::Videos, "webm", &mut reader, 1024)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Io { .. });
        assert_eq!(files_in(&dir.path().join("videos")), 0);
    }

    #[tokio::test]
    async fn handles_are_not_paths() {
        let (_dir, store) = store().await;
        for bad in ["../etc/passwd", "videos/../x", "other/abc.mp4", "videos/", "videos/.hidden", "videos/a/b"] {
            assert_matches!(store.open(bad).await, Err(Error::NotFound { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn save_bytes_into_thumbnails() {
        let (_dir, store) = store().await;
        let blob = store
            .save_bytes(BlobNamespace::Thumbnails, "jpg", b"\xff\xd8jpeg")
            .await
            .unwrap();
        assert!(blob.handle.starts_with("thumbnails/"));
        assert!(store.local_path(&blob.handle).unwrap().exists());
    }

    #[test]
    fn extension_is_sanitized() {
        let handle = LocalBlobStore::new_handle(BlobNamespace::Videos, "../mp4");
        assert!(handle.ends_with(".mp4"));
        let handle = LocalBlobStore::new_handle(BlobNamespace::Videos, "");
        assert!(handle.ends_with(".bin"));
    }
}
