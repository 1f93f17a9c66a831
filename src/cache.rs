//! Disk-backed blob cache with TTL expiry and atomic writes.
//!
//! Entries live at `<root>/<provider>/<category>/<key>`. An entry older than
//! the configured expiration is treated as absent. Writes go to a fresh temp
//! name in the same directory and are renamed into place, so concurrent
//! readers in any process observe either the previous bytes or the new bytes,
//! never a torn write. The cache is shared machine-wide; rename atomicity is
//! the only coordination.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache key {0:?} contains characters outside [A-Za-z0-9._-]")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PersistentCache {
    dir: PathBuf,
    expiration: Duration,
}

impl PersistentCache {
    /// Open (creating if needed) the cache directory for one provider and
    /// category. Safe to call concurrently from multiple tasks or processes.
    pub async fn new(
        root: impl AsRef<Path>,
        provider: &str,
        category: &str,
        expiration: Duration,
    ) -> Result<Self, CacheError> {
        let dir = root.as_ref().join(provider).join(category);
        tokio::fs::create_dir_all(&dir).await?;
        restrict_dir_permissions(&dir).await?;
        Ok(Self { dir, expiration })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty()
            || !key.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err(CacheError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(key))
    }

    /// Entry bytes, or `None` when missing or expired.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mtime = metadata.modified()?;
        let age = SystemTime::now().duration_since(mtime).unwrap_or(Duration::ZERO);
        if age > self.expiration {
            return Ok(None);
        }
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            // Entry vanished between stat and read (concurrent clear).
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write an entry atomically: temp file in the same directory, then rename.
    pub async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;
        let temp = self.dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, bytes).await?;
        restrict_file_permissions(&temp).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    /// Names of all non-temp entries, expired ones included.
    pub async fn entries(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(".tmp-") {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the cache directory, optionally recreating it empty.
    pub async fn clear(&self, leave_empty_dir: bool) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if leave_empty_dir {
            tokio::fs::create_dir_all(&self.dir).await?;
            restrict_dir_permissions(&self.dir).await?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_dir_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn restrict_dir_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
