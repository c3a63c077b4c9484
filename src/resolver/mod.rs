//! The transport-level resolver.
//!
//! A resolver owns the registered sources, the filemap memo, the shard
//! fetch deduplicator and the progress registry. Two installations share
//! it: a service worker in the browser and an in-process request hook on
//! native targets. Both feed request paths into [`Resolver::handle`] and
//! turn the returned [`Payload`] into their environment's response type.

mod control;
mod payload;
mod reassemble;

#[cfg(not(target_arch = "wasm32"))]
mod hook;
#[cfg(target_arch = "wasm32")]
mod worker;

use std::sync::Arc;

pub use control::*;
#[cfg(not(target_arch = "wasm32"))]
pub use hook::*;
pub use payload::*;
pub use reassemble::*;
use tokio::sync::RwLock;
#[cfg(target_arch = "wasm32")]
pub use worker::*;

use crate::{
    filemap::{Filemap, FilemapLoader},
    progress::ProgressRegistry,
    source::{Source, SourceBase},
    store::{self, ShardFetcher, ShardStore, filesystem},
};

#[derive(Clone)]
pub struct Resolver {
    store: Arc<ShardStore>,
    fetcher: ShardFetcher,
    loader: FilemapLoader,
    progress: ProgressRegistry,
    sources: Arc<RwLock<Vec<Source>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_store(Arc::new(ShardStore::new()))
    }

    pub fn with_store(store: Arc<ShardStore>) -> Self {
        Self {
            fetcher: ShardFetcher::new(store.clone()),
            loader: FilemapLoader::new(store.clone()),
            progress: ProgressRegistry::new(),
            store,
            sources: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    /// Replace all registered sources and begin their filemap loads.
    pub async fn init(&self, sources: Vec<Source>) {
        self.progress.reset(&sources).await;
        *self.sources.write().await = sources.clone();
        for source in sources {
            let this = self.clone();
            crate::utils::spawn(async move {
                this.ensure_filemap(&source).await;
            });
        }
    }

    /// First registered source whose prefix covers `path` with a non-empty
    /// remainder.
    pub async fn match_request(&self, path: &str) -> Option<(Source, String)> {
        let sources = self.sources.read().await;
        sources.iter().find_map(|s| {
            s.match_path(path)
                .map(|rel| (s.clone(), rel.to_owned()))
        })
    }

    async fn ensure_filemap(&self, source: &Source) -> Option<Arc<Filemap>> {
        match self.loader.load(source).await {
            Ok(Some(filemap)) => {
                self.progress
                    .init_from_filemap(source.path_prefix(), filemap.clone())
                    .await;
                Some(filemap)
            }
            Ok(None) => None,
            Err(e) => {
                crate::warn!("filemap load failed for {}: {e}", source.key());
                None
            }
        }
    }

    /// Offer a request to the resolver.
    ///
    /// `None` means the path is outside every registered prefix and the
    /// caller should forward to the original transport. A matched request
    /// always produces an HTTP-shaped payload, whatever happens inside.
    pub async fn handle(&self, path: &str, range_header: Option<&str>) -> Option<Payload> {
        let (source, rel_path) = self.match_request(path).await?;
        let filemap = self.ensure_filemap(&source).await;

        let entry = filemap.as_ref().and_then(|fm| fm.entry(&rel_path)).cloned();
        let Some(entry) = entry else {
            return Some(self.handle_miss(&source, &rel_path).await);
        };

        self.progress
            .note_request(source.path_prefix(), &rel_path)
            .await;
        let progress = self.progress.handle_for(source.path_prefix()).await;

        let payload = match parse_range(range_header, entry.size()) {
            RangeSpec::Unsatisfiable => Payload::not_satisfiable(entry.size()),
            RangeSpec::Full => read_full(self.fetcher.clone(), source, rel_path, entry, progress),
            RangeSpec::Window(start, end) => {
                read_range(
                    self.fetcher.clone(),
                    source,
                    rel_path,
                    entry,
                    start,
                    end,
                    progress,
                )
                .await
            }
        };
        Some(payload)
    }

    /// A path under a registered prefix that the filemap does not know.
    ///
    /// Local sources answer from the package directory as literal files.
    /// Remote sources proxy the CDN and re-emit the answer as a fresh
    /// same-origin payload so the embedder stays cross-origin isolated.
    async fn handle_miss(&self, source: &Source, rel_path: &str) -> Payload {
        match &source.base {
            SourceBase::Local(base) => {
                let path = base.join(rel_path);
                if !filesystem::exists(&path).await {
                    return Payload::not_found();
                }
                match filesystem::read(&path).await {
                    Ok(bytes) => Payload::full(bytes.into()),
                    Err(e) => Payload::internal_error(e),
                }
            }
            SourceBase::Remote(_) => {
                let _guard = match self.progress.handle_for(source.path_prefix()).await {
                    Some(p) => p.guard().await,
                    None => None,
                };
                let url = source.object_url(rel_path);
                match store::proxy(&url).await {
                    Ok(body) => Payload::proxied(body.status, body.bytes),
                    Err(e) => Payload::internal_error(e),
                }
            }
        }
    }

    /// Force-finalize one source's progress.
    pub async fn complete(&self, prefix: &str) {
        self.progress.complete(prefix).await;
    }

    /// Drop the durable caches and the filemap memo.
    pub async fn clear_cache(&self) {
        self.store.clear_cache().await;
        self.loader.clear().await;
    }

    /// Introspection for the control surface.
    pub async fn status(&self) -> (Vec<String>, Vec<String>) {
        let sources = self
            .sources
            .read()
            .await
            .iter()
            .map(|s| s.path_prefix().to_owned())
            .collect();
        let filemaps = self.loader.loaded_keys().await;
        (sources, filemaps)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
