use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::evidence::sha256_hex;

const MAX_READABLE_PREFIX: usize = 64;

/// URL-keyed store of downloaded payloads shared by every session.
///
/// Entries are written to a temporary file inside the cache directory and
/// renamed into place, so readers never observe a partial entry. Two writers
/// racing on one key both succeed; the last rename wins.
#[derive(Debug, Clone)]
pub struct PayloadCache {
    dir: PathBuf,
}

impl PayloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Readable URL prefix plus a digest of the full URL.
    pub fn key_for(url: &str) -> String {
        let readable: String = url
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_READABLE_PREFIX)
            .collect();
        let digest = sha256_hex(url.as_bytes());
        format!("{readable}_{}", &digest[..16])
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(Self::key_for(url))
    }

    pub fn get(&self, url: &str) -> Option<PathBuf> {
        let path = self.path_for(url);
        if path.is_file() {
            debug!("cache hit url={url} path={}", path.display());
            Some(path)
        } else {
            None
        }
    }

    pub fn put_bytes(&self, url: &str, data: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        let path = self.path_for(url);
        tmp.persist(&path).map_err(|err| err.error)?;
        info!("cached url={url} bytes={} path={}", data.len(), path.display());
        Ok(path)
    }

    pub fn put(&self, url: &str, source: &Path) -> Result<PathBuf> {
        let data = std::fs::read(source)?;
        self.put_bytes(url, &data)
    }

    /// Copy a cached entry to `dest`. Returns false on a miss.
    pub fn restore(&self, url: &str, dest: &Path) -> Result<bool> {
        let Some(cached) = self.get(url) else {
            return Ok(false);
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&cached, dest)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn keys_are_stable_and_distinct() {
        let a = PayloadCache::key_for("http://h/x.iso");
        assert_eq!(a, PayloadCache::key_for("http://h/x.iso"));
        assert_ne!(a, PayloadCache::key_for("http://h/x.iso?2"));
        assert!(a.starts_with("http___h_x.iso_"));
        assert!(!a.contains('/'));
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = PayloadCache::new(dir.path().join("cache"));
        let url = "http://h/x.iso";
        assert!(cache.get(url).is_none());

        cache.put_bytes(url, b"payload").expect("put");
        let hit = cache.get(url).expect("hit");
        assert_eq!(std::fs::read(hit).expect("read"), b"payload");

        let dest = dir.path().join("work/x.iso");
        assert!(cache.restore(url, &dest).expect("restore"));
        assert_eq!(std::fs::read(dest).expect("read"), b"payload");
        assert!(!cache.restore("http://other/", &dir.path().join("y")).expect("restore"));
    }

    #[test]
    fn concurrent_writers_on_same_key_succeed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(PayloadCache::new(dir.path()));
        let url = "http://h/same.iso";
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.put_bytes(url, &[7u8; 4096]).map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join").expect("put");
        }
        let entry = cache.get(url).expect("entry");
        assert_eq!(std::fs::read(entry).expect("read"), vec![7u8; 4096]);
        let leftovers = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }
}
