//! On-disk resource cache with freshness metadata.
//!
//! Each entry is two files named by the SHA-256 of its logical key: the
//! payload (`.bin`) and a JSON sidecar (`.json`) holding key, creation time,
//! expiry and length. A cache-wide `RwLock` is held by every handle until it
//! is finished or dropped: readers share it, a writer filling a miss holds it
//! exclusively.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, VxiError};

/// `maxage` / `maxstale` as in the fetch attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Oldest acceptable entry age; `None` accepts any age.
    pub max_age: Option<Duration>,
    /// How long past expiry an entry is still acceptable.
    pub max_stale: Duration,
}

impl FreshnessPolicy {
    pub fn max_age(age: Duration) -> Self {
        Self {
            max_age: Some(age),
            max_stale: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    pub key: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub len: u64,
}

fn chrono_span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub struct ResourceCache {
    dir: PathBuf,
    lock: RwLock<()>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("dir", &self.dir)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

/// Result of [`ResourceCache::start_entry`].
pub enum CacheEntry<'a> {
    Hit(CacheReader<'a>),
    Miss(CacheWriter<'a>),
}

impl ResourceCache {
    pub fn open(dir: impl Into<PathBuf>, default_ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| VxiError::Cache(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        (
            self.dir.join(format!("{name}.bin")),
            self.dir.join(format!("{name}.json")),
        )
    }

    fn read_meta(&self, key: &str) -> Option<EntryMeta> {
        let (_, meta_path) = self.paths(key);
        let raw = fs::read(meta_path).ok()?;
        match serde_json::from_slice::<EntryMeta>(&raw) {
            Ok(meta) if meta.key == key => Some(meta),
            Ok(_) => None,
            Err(e) => {
                warn!(key, error = %e, "unreadable cache sidecar");
                None
            }
        }
    }

    fn is_fresh(meta: &EntryMeta, policy: FreshnessPolicy, now: DateTime<Utc>) -> bool {
        let age_ok = policy
            .max_age
            .map_or(true, |max| now - meta.created <= chrono_span(max));
        age_ok && now <= meta.expires + chrono_span(policy.max_stale)
    }

    /// Look up `key`. A fresh entry yields a shared reader; anything else
    /// yields an exclusive writer for the caller to fill.
    pub fn start_entry(&self, key: &str, policy: FreshnessPolicy) -> Result<CacheEntry<'_>> {
        let guard = self.lock.upgradable_read();
        let (data_path, meta_path) = self.paths(key);
        if let Some(meta) = self.read_meta(key) {
            if Self::is_fresh(&meta, policy, Utc::now()) {
                if let Ok(file) = File::open(&data_path) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key, len = meta.len, "cache hit");
                    return Ok(CacheEntry::Hit(CacheReader {
                        _guard: RwLockUpgradableReadGuard::downgrade(guard),
                        file,
                        meta,
                    }));
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache miss");
        let guard = RwLockUpgradableReadGuard::upgrade(guard);
        let tmp_path = data_path.with_extension("tmp");
        let file = File::create(&tmp_path)
            .map_err(|e| VxiError::Cache(format!("create {}: {e}", tmp_path.display())))?;
        Ok(CacheEntry::Miss(CacheWriter {
            _guard: guard,
            key: key.to_string(),
            data_path,
            meta_path,
            tmp_path,
            file: Some(BufWriter::new(file)),
            expires: Utc::now() + chrono_span(self.default_ttl),
            written: 0,
        }))
    }

    /// Remove one entry.
    pub fn invalidate(&self, key: &str) {
        let _guard = self.lock.write();
        let (data_path, meta_path) = self.paths(key);
        let _ = fs::remove_file(data_path);
        let _ = fs::remove_file(meta_path);
    }
}

pub struct CacheReader<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    file: File,
    meta: EntryMeta,
}

impl CacheReader<'_> {
    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    /// Read the payload and release the lock.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.meta.len as usize);
        self.file.read_to_end(&mut out)?;
        if out.len() as u64 != self.meta.len {
            return Err(VxiError::Cache(format!(
                "entry '{}' is {} bytes, sidecar says {}",
                self.meta.key,
                out.len(),
                self.meta.len
            )));
        }
        Ok(out)
    }
}

impl Read for CacheReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// Exclusive handle filling a missed entry. Dropping it unfinished counts as
/// a failure: the partial payload is removed.
pub struct CacheWriter<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    key: String,
    data_path: PathBuf,
    meta_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    expires: DateTime<Utc>,
    written: u64,
}

impl CacheWriter<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_expiry(&mut self, expires: DateTime<Utc>) {
        self.expires = expires;
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.expires = Utc::now() + chrono_span(ttl);
    }

    /// Persist (success) or discard (failure) the entry, then release the
    /// lock.
    pub fn finish(mut self, success: bool) -> Result<()> {
        let file = self.file.take();
        if !success {
            drop(file);
            let _ = fs::remove_file(&self.tmp_path);
            debug!(key = %self.key, "cache entry discarded");
            return Ok(());
        }
        if let Some(mut file) = file {
            file.flush()?;
        }
        let meta = EntryMeta {
            key: self.key.clone(),
            created: Utc::now(),
            expires: self.expires,
            len: self.written,
        };
        fs::rename(&self.tmp_path, &self.data_path)
            .map_err(|e| VxiError::Cache(format!("commit {}: {e}", self.data_path.display())))?;
        fs::write(&self.meta_path, serde_json::to_vec_pretty(&meta)?)?;
        debug!(key = %self.key, len = self.written, "cache entry stored");
        Ok(())
    }
}

impl Write for CacheWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("cache entry already finished"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
