//! Content-addressed blob cache shared across transport pipelines (C1).
//!
//! Two tiers: an in-memory overlay ([`moka::future::Cache`]) and a filesystem
//! base directory. `get` favours the overlay and promotes a base hit into it;
//! `add` only ever writes the base, per the spec's "writes go to the base,
//! the overlay is repopulated on read" rule. Concurrent `add()` calls for the
//! same key are serialised through a second cache (`writes`) via
//! `entry_by_ref().or_try_insert_with()`, so only one caller's future ever
//! touches the tmp file for a given key.

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{error, warn};
use moka::future::Cache;
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags, ResolveFlags};
use rustix::io::Errno;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid blob key")]
    InvalidKey,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("errno: {0}")]
    Errno(#[from] Errno),
    #[error("concurrent write failed: {0}")]
    ConcurrentWrite(String),
}

/// A validated `(media-type,digest)` cache key, rendered as `algo:hex`.
///
/// Rejects `.` and `/` so it can be used directly as a two-level filesystem
/// path component without escaping the cache directory.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(s: impl Into<String>) -> Option<Self> {
        let s = s.into();
        if s.contains('.') || s.contains('/') {
            return None;
        }
        match s.split_once(':') {
            Some((algo, hex)) if !algo.is_empty() && !hex.is_empty() => Some(Self(s)),
            _ => None,
        }
    }

    pub fn encoded(&self) -> &str {
        &self.0
    }

    fn as_path(&self) -> String {
        self.0.replacen(':', "/", 1)
    }

    fn tmp_path(&self) -> String {
        format!("{}_tmp", self.as_path())
    }

    fn algo(&self) -> &str {
        // validated in `new`
        self.0.split_once(':').unwrap().0
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reader over a cached blob, from either the memory overlay or the
/// filesystem base.
pub enum BlobReader {
    Memory(Cursor<Bytes>),
    File(tokio::fs::File),
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BlobReader::Memory(c) => Pin::new(c).poll_read(cx, buf),
            BlobReader::File(f) => Pin::new(f).poll_read(cx, buf),
        }
    }
}

fn weigher(_key: &BlobKey, value: &Bytes) -> u32 {
    value.len().try_into().unwrap_or(u32::MAX)
}

pub struct BlobCache {
    base: OwnedFd,
    overlay: Cache<BlobKey, Bytes>,
    /// Per-key write lock: `entry_by_ref().or_try_insert_with()` makes
    /// concurrent `add()` calls for the same key race on a single in-flight
    /// future instead of the shared tmp file, the same way
    /// `ocidist_cache::Client::get_blob` serialises concurrent blob fetches.
    writes: Cache<BlobKey, ()>,
}

impl BlobCache {
    /// Open (creating if necessary) a blob cache rooted at `path`, with the
    /// memory overlay bounded to `overlay_capacity_bytes`.
    pub fn open(path: impl AsRef<std::path::Path>, overlay_capacity_bytes: u64) -> Result<Self, Error> {
        let base = open_or_create_dir(path.as_ref())?;
        let overlay = Cache::builder()
            .max_capacity(overlay_capacity_bytes)
            .weigher(weigher)
            .build();
        let writes = Cache::builder().max_capacity(100_000).build();
        Ok(Self { base, overlay, writes })
    }

    /// Stream `reader`'s bytes into the base layer under `key`. Idempotent:
    /// if the key already exists on disk this returns `Ok(())` without
    /// rewriting, since content at a key never changes. Concurrent `add()`
    /// calls for the same key are serialised on `writes` so only one of them
    /// actually touches the tmp file.
    pub async fn add(
        &self,
        key: &BlobKey,
        reader: impl AsyncRead + Unpin,
    ) -> Result<(), Error> {
        self.writes
            .entry_by_ref(key)
            .or_try_insert_with(self.write_to_base(key, reader))
            .await
            .map(|_| ())
            .map_err(|e| Error::ConcurrentWrite(e.to_string()))
    }

    async fn write_to_base(&self, key: &BlobKey, mut reader: impl AsyncRead + Unpin) -> Result<(), Error> {
        if self.exists_on_disk(key)? {
            // drain the reader so callers can always treat add() as a sink
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            return Ok(());
        }

        let mut file = self.create_tmp(key)?;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);
        self.commit_tmp(key)?;
        Ok(())
    }

    /// Fetch a fresh reader for `key`. Overlay miss promotes the base copy
    /// into the overlay; a promotion failure is logged and swallowed, never
    /// propagated, since the overlay is best-effort.
    pub async fn get(&self, key: &BlobKey) -> Result<Option<BlobReader>, Error> {
        if let Some(bytes) = self.overlay.get(key).await {
            return Ok(Some(BlobReader::Memory(Cursor::new(bytes))));
        }

        let Some(mut file) = self.open_base(key)? else {
            return Ok(None);
        };

        match read_all(&mut file).await {
            Ok(bytes) => {
                let bytes = Bytes::from(bytes);
                self.overlay.insert(key.clone(), bytes.clone()).await;
                Ok(Some(BlobReader::Memory(Cursor::new(bytes))))
            }
            Err(e) => {
                warn!("blob cache overlay promotion failed for {key}: {e}, falling back to disk");
                let file = self.open_base(key)?.ok_or(Error::Io(e))?;
                Ok(Some(BlobReader::File(file)))
            }
        }
    }

    fn exists_on_disk(&self, key: &BlobKey) -> Result<bool, Error> {
        match rustix::fs::statat(&self.base, key.as_path(), rustix::fs::AtFlags::empty()) {
            Ok(_) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn open_base(&self, key: &BlobKey) -> Result<Option<tokio::fs::File>, Error> {
        match rustix::fs::openat2(
            &self.base,
            key.as_path(),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        ) {
            Ok(fd) => Ok(Some(tokio::fs::File::from_std(std::fs::File::from(fd)))),
            Err(Errno::NOENT) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_tmp(&self, key: &BlobKey) -> Result<tokio::fs::File, Error> {
        let open = || {
            rustix::fs::openat2(
                &self.base,
                key.tmp_path(),
                OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
                Mode::from_bits_truncate(0o644),
                ResolveFlags::BENEATH,
            )
        };
        let fd = match open() {
            Ok(fd) => fd,
            Err(Errno::NOENT) => {
                rustix::fs::mkdirat(&self.base, key.algo(), Mode::from_bits_truncate(0o744))?;
                open()?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(tokio::fs::File::from_std(std::fs::File::from(fd)))
    }

    fn commit_tmp(&self, key: &BlobKey) -> Result<(), Error> {
        rustix::fs::renameat(&self.base, key.tmp_path(), &self.base, key.as_path())?;
        Ok(())
    }
}

async fn read_all(file: &mut tokio::fs::File) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

fn open_or_create_dir(path: &std::path::Path) -> Result<OwnedFd, Error> {
    match rustix::fs::mkdir(path, Mode::from_bits_truncate(0o744)) {
        Ok(()) | Err(Errno::EXIST) => {}
        Err(e) => return Err(e.into()),
    }
    let fd = rustix::fs::open(
        path,
        OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> BlobKey {
        BlobKey::new(s).unwrap()
    }

    #[test]
    fn blob_key_rejects_unsafe_chars() {
        assert!(BlobKey::new("sha256:abcd").is_some());
        assert!(BlobKey::new("sha256/abcd").is_none());
        assert!(BlobKey::new("sha256:ab.cd").is_none());
        assert!(BlobKey::new("noseparator").is_none());
        assert!(BlobKey::new(":abcd").is_none());
        assert!(BlobKey::new("sha256:").is_none());
    }

    #[tokio::test]
    async fn add_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 10_000_000).unwrap();
        let k = key("sha256:deadbeef");
        cache.add(&k, Cursor::new(b"hello world".to_vec())).await.unwrap();

        let mut reader = cache.get(&k).await.unwrap().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 10_000_000).unwrap();
        assert!(cache.get(&key("sha256:ffff")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_is_idempotent_for_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 10_000_000).unwrap();
        let k = key("sha256:abc123");
        cache.add(&k, Cursor::new(b"first".to_vec())).await.unwrap();
        // second add with different (assumed-identical) content must not error
        cache.add(&k, Cursor::new(b"xx".to_vec())).await.unwrap();
        let mut reader = cache.get(&k).await.unwrap().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"first");
    }

    #[tokio::test]
    async fn second_get_hits_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 10_000_000).unwrap();
        let k = key("sha256:cafe");
        cache.add(&k, Cursor::new(b"payload".to_vec())).await.unwrap();
        let _ = cache.get(&k).await.unwrap().unwrap();
        assert!(cache.overlay.contains_key(&k));
    }
}
