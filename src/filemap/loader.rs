use std::{collections::HashMap, sync::Arc};

use futures::{FutureExt as _, future::Shared};
use tokio::sync::Mutex;

use crate::{
    constants::FILEMAP_NAME,
    error::{FilemapError, StoreError},
    filemap::Filemap,
    source::{Source, SourceBase},
    store::{self, ShardStore, filesystem},
    utils::BoxFuture,
};

type LoadResult = Result<Option<Arc<Filemap>>, FilemapError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// One-shot filemap loading, memoized per source key.
///
/// Concurrent callers for the same source coalesce on a single pending
/// future. A failed load clears its pending slot so a later call retries;
/// a successful load (including "no filemap here" for local sources) is
/// memoized for the loader's lifetime. Remote documents are additionally
/// memoized to disk under the cache root so a restart does not re-fetch.
#[derive(Clone)]
pub struct FilemapLoader {
    store: Arc<ShardStore>,
    loaded: Arc<Mutex<HashMap<String, Option<Arc<Filemap>>>>>,
    pending: Arc<Mutex<HashMap<String, SharedLoad>>>,
}

impl FilemapLoader {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self {
            store,
            loaded: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The already-loaded filemap for a source, if any. Never touches the
    /// network.
    pub async fn get_loaded(&self, source: &Source) -> Option<Arc<Filemap>> {
        self.loaded
            .lock()
            .await
            .get(&source.key())
            .cloned()
            .flatten()
    }

    /// Source keys with a successfully loaded filemap, for status reports.
    pub async fn loaded_keys(&self) -> Vec<String> {
        self.loaded
            .lock()
            .await
            .iter()
            .filter_map(|(k, v)| v.is_some().then(|| k.clone()))
            .collect()
    }

    /// Forget every memoized document. Pending loads are left to finish;
    /// their results land in the fresh memo.
    pub async fn clear(&self) {
        self.loaded.lock().await.clear();
    }

    pub async fn load(&self, source: &Source) -> LoadResult {
        let key = source.key();
        if let Some(hit) = self.loaded.lock().await.get(&key) {
            return Ok(hit.clone());
        }

        let fut = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(p) => p.clone(),
                None => {
                    let loaded = self.loaded.clone();
                    let pending_map = self.pending.clone();
                    let store = self.store.clone();
                    let source = source.clone();
                    let memo_key = key.clone();
                    let fut: BoxFuture<'static, LoadResult> = Box::pin(async move {
                        let res = load_uncached(&store, &source).await;
                        if let Ok(filemap) = &res {
                            loaded.lock().await.insert(memo_key.clone(), filemap.clone());
                        }
                        pending_map.lock().await.remove(&memo_key);
                        res
                    });
                    let shared = fut.shared();
                    pending.insert(key, shared.clone());
                    shared
                }
            }
        };
        fut.await
    }
}

async fn load_uncached(store: &ShardStore, source: &Source) -> LoadResult {
    let bytes: Option<Vec<u8>> = match &source.base {
        SourceBase::Local(base) => {
            let path = base.join(FILEMAP_NAME);
            if !filesystem::exists(&path).await {
                None
            } else {
                let data = filesystem::read(&path)
                    .await
                    .map_err(|e| FilemapError::Store(StoreError::io(&path, e)))?;
                Some(data)
            }
        }
        SourceBase::Remote(_) => {
            let memo = store.filemap_memo_path(source);
            if filesystem::exists(&memo).await {
                let data = filesystem::read(&memo)
                    .await
                    .map_err(|e| FilemapError::Store(StoreError::io(&memo, e)))?;
                Some(data)
            } else {
                let url = source.object_url(FILEMAP_NAME);
                let body = store::download(&url).await?;
                if let Err(e) = filesystem::write(&memo, &body, true).await {
                    crate::warn!("filemap memo write failed for {url}: {e}");
                }
                Some(body.to_vec())
            }
        }
    };

    match bytes {
        None => Ok(None),
        Some(bytes) => Ok(Some(Arc::new(Filemap::from_slice(&bytes)?))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn write_filemap(dir: &std::path::Path) {
        let doc = json!({
            "version": 5,
            "files": {
                "a.bin": { "size": 4, "sha256": "aa", "cdn_file": "a.bin" }
            }
        });
        std::fs::write(dir.join(FILEMAP_NAME), doc.to_string()).unwrap();
    }

    #[tokio::test]
    async fn memoizes_local_loads() {
        let dir = tempfile::tempdir().unwrap();
        write_filemap(dir.path());
        let source = Source::local("/m/", dir.path());
        let loader = FilemapLoader::new(Arc::new(ShardStore::with_root(dir.path().join("cache"))));

        let first = loader.load(&source).await.unwrap().unwrap();
        assert_eq!(first.files.len(), 1);

        // A rewrite after the first load is not observed: the memo answers.
        std::fs::remove_file(dir.path().join(FILEMAP_NAME)).unwrap();
        let second = loader.load(&source).await.unwrap().unwrap();
        assert_eq!(second.files.len(), 1);
        assert_eq!(loader.loaded_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_local_filemap_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let source = Source::local("/m/", dir.path());
        let loader = FilemapLoader::new(Arc::new(ShardStore::with_root(dir.path().join("cache"))));
        assert!(loader.load(&source).await.unwrap().is_none());
        assert!(loader.get_loaded(&source).await.is_none());
    }

    #[tokio::test]
    async fn schema_violation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let doc = json!({
            "version": 5,
            "files": {
                "a.bin": {
                    "size": 9,
                    "sha256": "aa",
                    "shards": [{ "file": "a.bin.shard.000", "offset": 0, "size": 4 }]
                }
            }
        });
        std::fs::write(dir.path().join(FILEMAP_NAME), doc.to_string()).unwrap();
        let source = Source::local("/m/", dir.path());
        let loader = FilemapLoader::new(Arc::new(ShardStore::with_root(dir.path().join("cache"))));
        assert!(matches!(
            loader.load(&source).await,
            Err(FilemapError::Schema(_))
        ));
    }
}
