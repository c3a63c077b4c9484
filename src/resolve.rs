//! Direct materialization of logical files to disk.
//!
//! For out-of-band consumers (native runtimes, the downloader CLI) that
//! want real files rather than intercepted reads. Each source resolves into
//! a deterministic directory under the cache root, so repeated calls reuse
//! completed files.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
};

use crate::{
    error::ResolveError,
    filemap::{FileEntry, Filemap, FilemapLoader},
    source::Source,
    store::{ShardFetcher, ShardStore, filesystem},
    utils::sha256_file,
};

/// Per-file tick reported while a resolve runs.
#[derive(Debug, Clone)]
pub struct ResolveProgress {
    pub file: String,
    pub current: usize,
    pub total: usize,
    /// The target already existed with the right size and was not rewritten.
    pub skipped: bool,
}

pub type ProgressFn = Box<dyn Fn(ResolveProgress) + Send + Sync>;

#[derive(Default)]
pub struct ResolveOptions {
    /// Restrict to one named manifest; `None` resolves every file.
    pub manifest: Option<String>,
    /// Hash each written file against the filemap's `sha256` and fail on
    /// mismatch.
    pub verify: bool,
    /// Materialize here instead of the deterministic cache directory.
    pub out_dir: Option<PathBuf>,
    pub on_progress: Option<ProgressFn>,
}

pub struct DirectResolver {
    store: Arc<ShardStore>,
    fetcher: ShardFetcher,
    loader: FilemapLoader,
}

impl DirectResolver {
    pub fn new() -> Self {
        Self::with_store(Arc::new(ShardStore::new()))
    }

    pub fn with_store(store: Arc<ShardStore>) -> Self {
        Self {
            fetcher: ShardFetcher::new(store.clone()),
            loader: FilemapLoader::new(store.clone()),
            store,
        }
    }

    pub fn loader(&self) -> &FilemapLoader {
        &self.loader
    }

    /// Where a source materializes:
    /// `{cache_root}/resolved/{sha256(source_key)[:12]}{_manifest}?/`.
    pub fn output_dir(&self, source: &Source, manifest: Option<&str>) -> PathBuf {
        let suffix = manifest.map(|m| format!("_{m}")).unwrap_or_default();
        self.store
            .root()
            .join("resolved")
            .join(format!("{}{suffix}", source.key_hash(12)))
    }

    fn target_dir(&self, source: &Source, opts: &ResolveOptions) -> PathBuf {
        opts.out_dir
            .clone()
            .unwrap_or_else(|| self.output_dir(source, opts.manifest.as_deref()))
    }

    /// Materialize the selected files and return the output directory.
    pub async fn resolve(
        &self,
        source: &Source,
        opts: &ResolveOptions,
    ) -> Result<PathBuf, ResolveError> {
        self.resolve_files(source, opts).await?;
        Ok(self.target_dir(source, opts))
    }

    /// Same as [`DirectResolver::resolve`], returning the absolute path of
    /// every materialized virtual path.
    pub async fn resolve_files(
        &self,
        source: &Source,
        opts: &ResolveOptions,
    ) -> Result<BTreeMap<String, PathBuf>, ResolveError> {
        let filemap = self
            .loader
            .load(source)
            .await?
            .ok_or_else(|| ResolveError::NoFilemap(source.key()))?;

        let files = select_files(&filemap, opts.manifest.as_deref())?;
        let out_dir = self.target_dir(source, opts);
        let total = files.len();

        let mut resolved = BTreeMap::new();
        for (i, vp) in files.into_iter().enumerate() {
            // select_files only returns paths the validated filemap knows.
            let entry = filemap.entry(&vp).cloned().ok_or_else(|| {
                ResolveError::Filemap(crate::error::FilemapError::Schema(format!(
                    "manifest references unknown file {vp}"
                )))
            })?;
            let target = out_dir.join(&vp);

            let mut skipped = false;
            if filesystem::exists(&target).await {
                let existing = filesystem::file_size(&target)
                    .await
                    .map_err(|e| ResolveError::io(&target, e))?;
                if existing == entry.size() {
                    skipped = true;
                }
            }

            if !skipped {
                self.materialize(source, &entry, &target).await?;
                if opts.verify && !entry.sha256().is_empty() {
                    let actual =
                        sha256_file(&target).await.map_err(|e| ResolveError::io(&target, e))?;
                    if actual != entry.sha256() {
                        let _ = filesystem::remove(&target).await;
                        return Err(ResolveError::Checksum {
                            path: target.to_string_lossy().into_owned(),
                            expected: entry.sha256().to_owned(),
                            actual,
                        });
                    }
                }
            }

            if let Some(cb) = &opts.on_progress {
                cb(ResolveProgress {
                    file: vp.clone(),
                    current: i + 1,
                    total,
                    skipped,
                });
            }
            resolved.insert(vp, target);
        }
        Ok(resolved)
    }

    /// Write one logical file. Shards land at their declared offsets rather
    /// than by appending, so an interrupted run leaves offsets intact.
    async fn materialize(
        &self,
        source: &Source,
        entry: &FileEntry,
        target: &std::path::Path,
    ) -> Result<(), ResolveError> {
        // A stale target of the wrong size would keep bytes past the end.
        if filesystem::exists(target).await {
            filesystem::remove(target)
                .await
                .map_err(|e| ResolveError::io(target, e))?;
        }
        match entry {
            FileEntry::Unsharded { cdn_file, .. } => {
                let bytes = self.fetcher.read_shard(source, cdn_file).await?;
                filesystem::write(target, &bytes, true)
                    .await
                    .map_err(|e| ResolveError::io(target, e))?;
            }
            FileEntry::Sharded { shards, .. } => {
                for shard in shards {
                    let bytes = self.fetcher.read_shard(source, &shard.file).await?;
                    filesystem::write_at(target, shard.offset, &bytes)
                        .await
                        .map_err(|e| ResolveError::io(target, e))?;
                }
            }
        }
        Ok(())
    }
}

impl Default for DirectResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn select_files(filemap: &Filemap, manifest: Option<&str>) -> Result<Vec<String>, ResolveError> {
    match manifest {
        Some(name) => {
            let entry = filemap
                .manifests
                .get(name)
                .ok_or_else(|| ResolveError::UnknownManifest(name.to_owned()))?;
            Ok(entry.files.clone())
        }
        None => Ok(filemap.files.keys().cloned().collect()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::utils::sha256_hex;

    fn write_package(dir: &std::path::Path) -> (String, String) {
        let a: Vec<u8> = (0u8..=24).collect();
        std::fs::write(dir.join("a.bin.shard.000"), &a[..10]).unwrap();
        std::fs::write(dir.join("a.bin.shard.001"), &a[10..20]).unwrap();
        std::fs::write(dir.join("a.bin.shard.002"), &a[20..]).unwrap();
        std::fs::write(dir.join("tok.json"), b"tok").unwrap();
        let a_hash = sha256_hex(&a);
        let tok_hash = sha256_hex(b"tok");
        let doc = json!({
            "version": 5,
            "files": {
                "a.bin": {
                    "size": 25,
                    "sha256": a_hash,
                    "shards": [
                        { "file": "a.bin.shard.000", "offset": 0, "size": 10 },
                        { "file": "a.bin.shard.001", "offset": 10, "size": 10 },
                        { "file": "a.bin.shard.002", "offset": 20, "size": 5 }
                    ]
                },
                "tok.json": { "size": 3, "sha256": tok_hash, "cdn_file": "tok.json" }
            },
            "manifests": {
                "small": { "files": ["tok.json"], "size": 3 }
            }
        });
        std::fs::write(dir.join("filemap.json"), doc.to_string()).unwrap();
        (a_hash, tok_hash)
    }

    #[tokio::test]
    async fn resolves_and_verifies_all_files() {
        let pkg = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_package(pkg.path());
        let source = Source::local("/m/", pkg.path());
        let resolver = DirectResolver::with_store(Arc::new(ShardStore::with_root(cache.path())));

        let opts = ResolveOptions {
            verify: true,
            ..Default::default()
        };
        let files = resolver.resolve_files(&source, &opts).await.unwrap();
        assert_eq!(files.len(), 2);
        let a: Vec<u8> = (0u8..=24).collect();
        assert_eq!(std::fs::read(&files["a.bin"]).unwrap(), a);
        assert_eq!(std::fs::read(&files["tok.json"]).unwrap(), b"tok");

        // Second resolve skips everything that is already in place.
        let opts = ResolveOptions {
            verify: true,
            on_progress: Some(Box::new(|p| assert!(p.skipped, "{} rewritten", p.file))),
            ..Default::default()
        };
        resolver.resolve_files(&source, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn manifest_restricts_and_names_output_dir() {
        let pkg = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_package(pkg.path());
        let source = Source::local("/m/", pkg.path());
        let resolver = DirectResolver::with_store(Arc::new(ShardStore::with_root(cache.path())));

        let opts = ResolveOptions {
            manifest: Some("small".into()),
            ..Default::default()
        };
        let out = resolver.resolve(&source, &opts).await.unwrap();
        assert!(out.file_name().unwrap().to_string_lossy().ends_with("_small"));
        assert!(out.join("tok.json").exists());
        assert!(!out.join("a.bin").exists());

        let missing = ResolveOptions {
            manifest: Some("typo".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolver.resolve(&source, &missing).await,
            Err(ResolveError::UnknownManifest(_))
        ));
    }

    #[tokio::test]
    async fn checksum_mismatch_deletes_and_fails() {
        let pkg = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_package(pkg.path());
        // Corrupt one shard after the filemap was written.
        std::fs::write(pkg.path().join("a.bin.shard.001"), vec![0u8; 10]).unwrap();
        let source = Source::local("/m/", pkg.path());
        let resolver = DirectResolver::with_store(Arc::new(ShardStore::with_root(cache.path())));

        let opts = ResolveOptions {
            verify: true,
            ..Default::default()
        };
        let err = resolver.resolve_files(&source, &opts).await.unwrap_err();
        let ResolveError::Checksum { path, .. } = err else {
            panic!("expected checksum failure, got {err}");
        };
        assert!(!std::path::Path::new(&path).exists());
    }
}
