use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use futures::{FutureExt as _, future::Shared};
use tokio::sync::Mutex;

use crate::{
    error::StoreError,
    source::{Source, SourceBase},
    store::ShardStore,
    utils::BoxFuture,
};

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, StoreError>>>;

/// Coalesces concurrent requests for one shard into a single network fetch.
///
/// Keys are absolute shard URLs. Local shards bypass the map entirely: the
/// filesystem already deduplicates reads. After any successful fetch the
/// durable cache is the source of truth; a failed fetch clears its slot so
/// the next caller retries.
#[derive(Clone)]
pub struct ShardFetcher {
    store: Arc<ShardStore>,
    inflight: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl ShardFetcher {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self {
            store,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    /// Read a whole shard, deduplicating concurrent fetches per shard URL.
    pub async fn read_shard(&self, source: &Source, shard_name: &str) -> Result<Bytes, StoreError> {
        if matches!(source.base, SourceBase::Local(_)) {
            return self.store.read_shard(source, shard_name).await;
        }

        let url = source.object_url(shard_name);
        if let Some(bytes) = self.store.cached(&url).await {
            return Ok(bytes);
        }

        let fut = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&url) {
                Some(pending) => pending.clone(),
                None => {
                    let store = self.store.clone();
                    let map = self.inflight.clone();
                    let key = url.clone();
                    let fut: BoxFuture<'static, Result<Bytes, StoreError>> =
                        Box::pin(async move {
                            let res = store.fetch_shard(&key).await;
                            // Clear the slot on success and failure alike;
                            // the cache answers future hits, and failures
                            // must stay retryable.
                            map.lock().await.remove(&key);
                            res
                        });
                    let shared = fut.shared();
                    inflight.insert(url, shared.clone());
                    shared
                }
            }
        };
        fut.await
    }
}
