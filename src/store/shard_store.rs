use std::{
    env::var,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::{
    error::StoreError,
    source::{Source, SourceBase},
    store::{filesystem, http},
};

/// Resolve the local cache root.
///
/// Overridable with `SHARDCAST_CACHE_ROOT`; defaults to
/// `$HOME/.cache/shardcast` (unix), `%LOCALAPPDATA%\shardcast` (windows) or
/// `/shardcast` in OPFS (wasm).
pub fn default_cache_root() -> PathBuf {
    match var("SHARDCAST_CACHE_ROOT") {
        Ok(env_path) => PathBuf::from(env_path),
        Err(_) => {
            #[cfg(target_family = "unix")]
            {
                PathBuf::from(var("HOME").unwrap())
                    .join(".cache")
                    .join("shardcast")
            }
            #[cfg(target_family = "windows")]
            {
                PathBuf::from(var("LOCALAPPDATA").unwrap()).join("shardcast")
            }
            #[cfg(target_family = "wasm")]
            {
                PathBuf::from("/").join("shardcast")
            }
        }
    }
}

/// Content-addressed shard storage.
///
/// Local sources read straight from their flat package directory. Remote
/// sources GET `{cdn_base}/{shard}` with bounded retries and write the body
/// through to a durable cache under the cache root, so a given shard crosses
/// the network once per machine.
#[derive(Debug, Clone)]
pub struct ShardStore {
    cache_root: PathBuf,
}

impl ShardStore {
    pub fn new() -> Self {
        Self {
            cache_root: default_cache_root(),
        }
    }

    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.cache_root
    }

    fn shards_dir(&self) -> PathBuf {
        self.cache_root.join("shards")
    }

    /// Disk memo for a source's filemap document, keyed by source hash.
    pub fn filemap_memo_path(&self, source: &Source) -> PathBuf {
        self.cache_root
            .join("filemaps")
            .join(format!("{}.json", source.key_hash(16)))
    }

    /// Cache location for a shard: first 16 hex chars of SHA-256 over the
    /// absolute shard URL, concatenated with the shard basename.
    pub fn cache_path(&self, shard_url: &str) -> PathBuf {
        let digest = Sha256::digest(shard_url.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(16);
        let basename = shard_url.rsplit('/').next().unwrap_or(shard_url);
        self.shards_dir().join(format!("{hash}{basename}"))
    }

    /// Return cached bytes for a shard URL, if any.
    pub async fn cached(&self, shard_url: &str) -> Option<Bytes> {
        let path = self.cache_path(shard_url);
        if !filesystem::exists(&path).await {
            return None;
        }
        filesystem::read(&path).await.ok().map(Bytes::from)
    }

    /// Write a fetched shard into the durable cache. Best effort: a cache
    /// write failure must not fail the fetch that produced the bytes.
    async fn write_through(&self, shard_url: &str, bytes: &Bytes) {
        let path = self.cache_path(shard_url);
        if let Err(e) = filesystem::write(&path, bytes, true).await {
            crate::warn!("shard cache write failed for {shard_url}: {e}");
        }
    }

    /// Fetch a remote shard and write it through to the cache.
    pub async fn fetch_shard(&self, shard_url: &str) -> Result<Bytes, StoreError> {
        let bytes = http::download(shard_url).await?;
        self.write_through(shard_url, &bytes).await;
        Ok(bytes)
    }

    /// Read a whole shard for a source, from whichever backing it has.
    pub async fn read_shard(&self, source: &Source, shard_name: &str) -> Result<Bytes, StoreError> {
        match &source.base {
            SourceBase::Local(base) => {
                let path = base.join(shard_name);
                if !filesystem::exists(&path).await {
                    return Err(StoreError::NotFound(path.to_string_lossy().into_owned()));
                }
                let bytes = filesystem::read(&path)
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
                Ok(Bytes::from(bytes))
            }
            SourceBase::Remote(_) => {
                let url = source.object_url(shard_name);
                if let Some(bytes) = self.cached(&url).await {
                    return Ok(bytes);
                }
                self.fetch_shard(&url).await
            }
        }
    }

    /// Read `[start, end]` (inclusive, shard-local offsets) of a shard.
    ///
    /// Remote backings issue an HTTP byte-range request. An origin that
    /// ignores the header and answers `200` hands us the whole shard: the
    /// slice is taken in-process and the full body is cached for later
    /// readers.
    pub async fn read_shard_range(
        &self,
        source: &Source,
        shard_name: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StoreError> {
        match &source.base {
            SourceBase::Local(base) => {
                let path = base.join(shard_name);
                if !filesystem::exists(&path).await {
                    return Err(StoreError::NotFound(path.to_string_lossy().into_owned()));
                }
                let bytes = filesystem::read_range(&path, start, end)
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
                Ok(Bytes::from(bytes))
            }
            SourceBase::Remote(_) => {
                let url = source.object_url(shard_name);
                if let Some(bytes) = self.cached(&url).await {
                    return slice_body(&url, bytes, start, end);
                }
                let body = http::download_range(&url, start, end).await?;
                if body.status == 206 {
                    return Ok(body.bytes);
                }
                // Full body came back; keep it so later reads hit the cache.
                self.write_through(&url, &body.bytes).await;
                slice_body(&url, body.bytes, start, end)
            }
        }
    }

    /// Drop the durable caches (shards and filemap memos).
    pub async fn clear_cache(&self) {
        for dir in [self.shards_dir(), self.cache_root.join("filemaps")] {
            if filesystem::exists(&dir).await {
                if let Err(e) = filesystem::remove(&dir).await {
                    crate::warn!("failed to clear {}: {e}", dir.to_string_lossy());
                }
            }
        }
    }
}

impl Default for ShardStore {
    fn default() -> Self {
        Self::new()
    }
}

fn slice_body(url: &str, bytes: Bytes, start: u64, end: u64) -> Result<Bytes, StoreError> {
    let len = bytes.len() as u64;
    if start >= len || end >= len {
        return Err(StoreError::Fetch {
            url: url.to_owned(),
            attempts: 1,
            reason: format!("range {start}-{end} outside shard of {len} bytes"),
        });
    }
    Ok(bytes.slice(start as usize..=end as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_read_and_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.shard.000"), b"0123456789").unwrap();
        let source = Source::local("/m/", dir.path());
        let store = ShardStore::with_root(dir.path().join("cache"));

        let whole = store.read_shard(&source, "x.shard.000").await.unwrap();
        assert_eq!(&whole[..], b"0123456789");

        let mid = store
            .read_shard_range(&source, "x.shard.000", 3, 6)
            .await
            .unwrap();
        assert_eq!(&mid[..], b"3456");

        assert!(matches!(
            store.read_shard(&source, "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn cache_path_concatenates_hash_and_basename() {
        let store = ShardStore::with_root("/tmp/sc");
        let path = store.cache_path("https://cdn.example.com/pkg/model.bin.shard.001");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 16 + "model.bin.shard.001".len());
        assert!(name.ends_with("model.bin.shard.001"));
    }
}
