//! The packager: turns input artifacts into a flat directory of CDN-sized
//! shards plus a `filemap.json`.
//!
//! Phases: discover inputs, plan GGUF pre-splits, check disk space, hash
//! and dedup against any existing package, byte-split over-sized files,
//! record file entries, synthesize manifests. The filemap is written last,
//! only once every entry succeeded, so an aborted run never publishes a
//! corrupt document.

mod discover;
mod gguf;
mod manifest_synth;
mod split;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
};

pub use discover::*;
pub use gguf::*;
pub use manifest_synth::*;
pub use split::*;

use crate::{
    constants::{DEFAULT_CHUNK_SIZE, DEFAULT_GGUF_SHARD_SIZE, FILEMAP_NAME, GGUF_SHARD_SIZE_CAP},
    error::PackError,
    filemap::{FileEntry, Filemap},
    utils::sha256_file,
};

pub struct PackOptions {
    pub out_dir: PathBuf,
    /// Byte cap for a single CDN object.
    pub chunk_size: u64,
    /// Additive run against an existing package; dedup by SHA-256.
    pub merge: bool,
    /// Wipe an existing package first.
    pub overwrite: bool,
    /// Explicit manifest name for the whole run.
    pub manifest: Option<String>,
    /// Pre-split threshold for GGUF inputs; must stay below 2 GiB.
    pub gguf_shard_size: u64,
    pub keep_intermediates: bool,
    pub remove_originals: bool,
    pub exclude: Vec<String>,
    pub dry_run: bool,
    pub verbose: bool,
}

impl PackOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            merge: false,
            overwrite: false,
            manifest: None,
            gguf_shard_size: DEFAULT_GGUF_SHARD_SIZE,
            keep_intermediates: false,
            remove_originals: false,
            exclude: Vec::new(),
            dry_run: false,
            verbose: false,
        }
    }
}

/// What a packaging run did, for reporting.
#[derive(Debug)]
pub struct PackReport {
    pub out_dir: PathBuf,
    pub filemap: Filemap,
    /// CDN objects written by this run.
    pub written: Vec<String>,
    /// Virtual paths that reused existing storage via hash dedup.
    pub deduped: Vec<String>,
}

struct Deliverable {
    virtual_path: String,
    physical_path: PathBuf,
    size: u64,
    /// The logical GGUF this file belongs to (itself, or the original of a
    /// split piece).
    gguf_logical: Option<String>,
}

pub async fn pack(
    inputs: &[PathBuf],
    tools: &dyn GgufTools,
    opts: &PackOptions,
) -> Result<PackReport, PackError> {
    if opts.gguf_shard_size >= GGUF_SHARD_SIZE_CAP {
        return Err(PackError::InvalidArgs(format!(
            "gguf-shard-size must be strictly less than 2 GiB, got {}",
            opts.gguf_shard_size
        )));
    }
    if opts.chunk_size == 0 {
        return Err(PackError::InvalidArgs("chunk-size must be positive".into()));
    }
    if opts.merge && opts.overwrite {
        return Err(PackError::InvalidArgs(
            "--merge and --overwrite are mutually exclusive".into(),
        ));
    }

    // Phase 1: discovery.
    let discovered = discover(inputs, &opts.exclude)?;
    if discovered.is_empty() {
        return Err(PackError::InvalidArgs("no input files after exclusions".into()));
    }

    // Existing package handling.
    let filemap_path = opts.out_dir.join(FILEMAP_NAME);
    let mut existing: Option<Filemap> = None;
    if filemap_path.exists() {
        if opts.overwrite {
            if !opts.dry_run {
                tokio::fs::remove_dir_all(&opts.out_dir)
                    .await
                    .map_err(|e| PackError::io(&opts.out_dir, e))?;
            }
        } else if opts.merge {
            let bytes =
                std::fs::read(&filemap_path).map_err(|e| PackError::io(&filemap_path, e))?;
            let filemap = Filemap::from_slice(&bytes).map_err(|e| {
                PackError::InvalidArgs(format!("existing filemap is unusable: {e}"))
            })?;
            existing = Some(filemap);
        } else {
            return Err(PackError::InvalidArgs(
                "output directory already holds a package; pass --merge or --overwrite".into(),
            ));
        }
    }
    if !opts.dry_run {
        tokio::fs::create_dir_all(&opts.out_dir)
            .await
            .map_err(|e| PackError::io(&opts.out_dir, e))?;
    }

    // Phase 2a: plan GGUF pre-splits.
    let mut to_split: Vec<&InputFile> = Vec::new();
    for input in &discovered {
        let basename = input.virtual_path.rsplit('/').next().unwrap_or_default();
        if basename.ends_with(".gguf")
            && split_group(basename).is_none()
            && input.size > opts.gguf_shard_size
        {
            to_split.push(input);
        }
    }

    // Phase 3: disk space. Input + 1 % on the output volume, plus room for
    // the largest GGUF while its pieces and the original coexist.
    let total: u64 = discovered.iter().map(|f| f.size).sum();
    let largest_split = to_split.iter().map(|f| f.size).max().unwrap_or(0);
    if !opts.dry_run {
        let needed = total + total / 100 + largest_split;
        let available = fs2::available_space(&opts.out_dir)
            .map_err(|e| PackError::io(&opts.out_dir, e))?;
        if available < needed {
            return Err(PackError::DiskSpace {
                volume: opts.out_dir.to_string_lossy().into_owned(),
                needed,
                available,
            });
        }
    }

    // Phase 2b: run the splitter.
    let split_vps: HashSet<String> = to_split.iter().map(|f| f.virtual_path.clone()).collect();
    let tmp_dir = opts.out_dir.join(".gguf-split");
    let mut deliverables: Vec<Deliverable> = Vec::new();
    let mut split_originals: Vec<PathBuf> = Vec::new();
    for input in &discovered {
        let basename = input.virtual_path.rsplit('/').next().unwrap_or_default();
        if split_vps.contains(&input.virtual_path) && !opts.dry_run {
            tokio::fs::create_dir_all(&tmp_dir)
                .await
                .map_err(|e| PackError::io(&tmp_dir, e))?;
            let pieces = tools
                .split(&input.physical_path, &tmp_dir, opts.gguf_shard_size)
                .await
                .map_err(|e| map_tool_error("gguf splitter", e))?;
            if opts.verbose {
                crate::info!(
                    "pre-split {} into {} pieces",
                    input.virtual_path,
                    pieces.len()
                );
            }
            let vp_dir = parent_of(&input.virtual_path);
            for piece in pieces {
                let name = piece
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let size = piece
                    .metadata()
                    .map_err(|e| PackError::io(&piece, e))?
                    .len();
                deliverables.push(Deliverable {
                    virtual_path: join_vp(&vp_dir, &name),
                    physical_path: piece,
                    size,
                    gguf_logical: Some(input.virtual_path.clone()),
                });
            }
            split_originals.push(input.physical_path.clone());
            continue;
        }

        let gguf_logical = if basename.ends_with(".gguf") {
            match split_group(basename) {
                // A piece packaged as-is groups under its logical model.
                Some(group) => Some(join_vp(&parent_of(&input.virtual_path), &group)),
                None => Some(input.virtual_path.clone()),
            }
        } else {
            None
        };
        deliverables.push(Deliverable {
            virtual_path: input.virtual_path.clone(),
            physical_path: input.physical_path.clone(),
            size: input.size,
            gguf_logical,
        });
    }

    // Phase 4 and 5: hash, dedup, collision-check, byte-split, copy.
    let mut filemap = existing.clone().unwrap_or_default();
    let mut claimed_names: HashSet<String> = HashSet::new();
    let mut name_owners: HashMap<String, String> = HashMap::new();
    let mut hash_index: HashMap<String, FileEntry> = HashMap::new();
    if let Some(existing) = &existing {
        for (vp, entry) in &existing.files {
            hash_index.insert(entry.sha256().to_owned(), entry.clone());
            match entry {
                FileEntry::Unsharded { cdn_file, .. } => {
                    claimed_names.insert(cdn_file.clone());
                    name_owners.insert(cdn_file.clone(), vp.clone());
                }
                FileEntry::Sharded { shards, .. } => {
                    for shard in shards {
                        claimed_names.insert(shard.file.clone());
                        name_owners.insert(shard.file.clone(), vp.clone());
                    }
                }
            }
        }
    }

    let mut written: Vec<String> = Vec::new();
    let mut deduped: Vec<String> = Vec::new();
    let mut run_files: Vec<String> = Vec::new();
    let mut gguf_groups: BTreeMap<String, (Vec<String>, GgufInfo)> = BTreeMap::new();

    for deliverable in &deliverables {
        let vp = &deliverable.virtual_path;
        run_files.push(vp.clone());
        if let Some(logical) = &deliverable.gguf_logical {
            let group = gguf_groups
                .entry(logical.clone())
                .or_insert_with(|| (Vec::new(), GgufInfo::default()));
            group.0.push(vp.clone());
        }

        let sha = sha256_file(&deliverable.physical_path)
            .await
            .map_err(|e| PackError::io(&deliverable.physical_path, e))?;

        if let Some(entry) = hash_index.get(&sha) {
            // Same bytes already published: reuse the storage, write
            // nothing.
            if opts.verbose {
                crate::info!("dedup {vp} -> existing {sha}");
            }
            filemap.files.insert(vp.clone(), entry.clone());
            deduped.push(vp.clone());
            continue;
        }

        // Reserve the flat name before any bytes land on disk, so a
        // collision aborts without clobbering earlier output.
        let basename = vp.rsplit('/').next().unwrap_or(vp).to_owned();
        claim_name(&basename, vp, &mut claimed_names, &mut name_owners)?;
        let entry = if deliverable.size > opts.chunk_size {
            let shards = split_file(
                &deliverable.physical_path,
                &basename,
                &opts.out_dir,
                opts.chunk_size,
                opts.dry_run,
            )
            .await
            .map_err(|e| PackError::io(&deliverable.physical_path, e))?;
            for shard in &shards {
                claim_name(&shard.file, vp, &mut claimed_names, &mut name_owners)?;
                written.push(shard.file.clone());
            }
            FileEntry::Sharded {
                size: deliverable.size,
                sha256: sha.clone(),
                shards,
            }
        } else {
            if !opts.dry_run {
                let target = opts.out_dir.join(&basename);
                if deliverable.physical_path != target {
                    tokio::fs::copy(&deliverable.physical_path, &target)
                        .await
                        .map_err(|e| PackError::io(&deliverable.physical_path, e))?;
                }
            }
            written.push(basename.clone());
            FileEntry::Unsharded {
                size: deliverable.size,
                sha256: sha.clone(),
                cdn_file: basename,
            }
        };
        hash_index.insert(sha, entry.clone());
        filemap.files.insert(vp.clone(), entry);
    }

    // Phase 7: manifest synthesis, with GGUF metadata from the header
    // reader. Tool failures degrade to filename heuristics.
    for (logical, (members, info)) in gguf_groups.iter_mut() {
        members.sort();
        let probe = deliverables
            .iter()
            .find(|d| d.gguf_logical.as_ref() == Some(logical))
            .map(|d| d.physical_path.clone());
        if let Some(probe) = probe {
            match tools.read_metadata(&probe).await {
                Ok(read) => *info = read,
                Err(e) => {
                    crate::warn!("gguf metadata read failed for {logical}: {e}");
                    info.quantization = quant_from_name(logical);
                    info.projector = logical.contains("mmproj");
                }
            }
        }
    }
    let synth = SynthInput {
        run_files,
        gguf_groups,
    };
    synthesize(&mut filemap, &synth, opts.manifest.as_deref());

    // Phase 6 (last): publish the filemap.
    if !opts.dry_run {
        filemap
            .validate()
            .map_err(|e| PackError::InvalidArgs(format!("produced filemap invalid: {e}")))?;
        tokio::fs::write(&filemap_path, filemap.to_json_pretty())
            .await
            .map_err(|e| PackError::io(&filemap_path, e))?;

        if !opts.keep_intermediates && tmp_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
        }
        if opts.remove_originals {
            for original in &split_originals {
                if let Err(e) = tokio::fs::remove_file(original).await {
                    crate::warn!("failed to remove original {}: {e}", original.display());
                }
            }
        }
    }

    Ok(PackReport {
        out_dir: opts.out_dir.clone(),
        filemap,
        written,
        deduped,
    })
}

fn claim_name(
    name: &str,
    vp: &str,
    claimed: &mut HashSet<String>,
    owners: &mut HashMap<String, String>,
) -> Result<(), PackError> {
    if claimed.contains(name) {
        return Err(PackError::Collision {
            name: name.to_owned(),
            a: vp.to_owned(),
            b: owners.get(name).cloned().unwrap_or_else(|| "existing package".to_owned()),
        });
    }
    claimed.insert(name.to_owned());
    owners.insert(name.to_owned(), vp.to_owned());
    Ok(())
}

fn map_tool_error(tool: &str, e: anyhow::Error) -> PackError {
    let not_found = e
        .chain()
        .filter_map(|c| c.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::NotFound);
    if not_found {
        PackError::MissingTool(tool.to_owned())
    } else {
        PackError::Io {
            path: tool.to_owned(),
            reason: e.to_string(),
        }
    }
}

fn parent_of(vp: &str) -> String {
    match vp.rsplit_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => String::new(),
    }
}

fn join_vp(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::*;
    use crate::{
        resolve::{DirectResolver, ResolveOptions},
        source::Source,
        store::ShardStore,
        utils::BoxFuture,
    };

    /// Test stand-in for the external llama.cpp tools: splits by plain byte
    /// ranges and answers metadata from the file name.
    struct FakeGgufTools;

    impl GgufTools for FakeGgufTools {
        fn split<'a>(
            &'a self,
            input: &'a Path,
            out_dir: &'a Path,
            max_size: u64,
        ) -> BoxFuture<'a, anyhow::Result<Vec<PathBuf>>> {
            Box::pin(async move {
                let data = std::fs::read(input)?;
                let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
                let total = data.len().div_ceil(max_size as usize);
                let mut pieces = Vec::new();
                for (i, chunk) in data.chunks(max_size as usize).enumerate() {
                    let name = format!("{stem}-{:05}-of-{total:05}.gguf", i + 1);
                    let path = out_dir.join(&name);
                    std::fs::write(&path, chunk)?;
                    pieces.push(path);
                }
                Ok(pieces)
            })
        }

        fn read_metadata<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, anyhow::Result<GgufInfo>> {
            Box::pin(async move {
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                Ok(GgufInfo {
                    architecture: Some("qwen2".into()),
                    quantization: quant_from_name(&name),
                    projector: name.contains("mmproj"),
                })
            })
        }
    }

    fn write_tree(dir: &Path) {
        let root = dir.join("model");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("tokenizer.json"), b"tok").unwrap();
        // 25 bytes, split at chunk_size 10 below.
        let big: Vec<u8> = (0u8..25).collect();
        std::fs::write(root.join("weights.bin"), &big).unwrap();
    }

    fn options(out: &Path) -> PackOptions {
        let mut opts = PackOptions::new(out);
        opts.chunk_size = 10;
        opts
    }

    #[tokio::test]
    async fn pack_then_resolve_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let out = dir.path().join("out");
        let report = pack(&[dir.path().join("model")], &FakeGgufTools, &options(&out))
            .await
            .unwrap();
        assert!(out.join(FILEMAP_NAME).exists());
        assert_eq!(report.deduped.len(), 0);
        // weights.bin became three shards, tokenizer.json one flat object.
        assert!(out.join("weights.bin.shard.000").exists());
        assert!(out.join("weights.bin.shard.002").exists());
        assert!(out.join("tokenizer.json").exists());

        let cache = tempfile::tempdir().unwrap();
        let resolver = DirectResolver::with_store(Arc::new(ShardStore::with_root(cache.path())));
        let source = Source::local("/m/", &out);
        let opts = ResolveOptions {
            verify: true,
            ..Default::default()
        };
        let files = resolver.resolve_files(&source, &opts).await.unwrap();
        assert_eq!(
            std::fs::read(&files["model/weights.bin"]).unwrap(),
            (0u8..25).collect::<Vec<u8>>()
        );
        assert_eq!(std::fs::read(&files["model/tokenizer.json"]).unwrap(), b"tok");
    }

    #[tokio::test]
    async fn merge_repack_is_a_dedup_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let out = dir.path().join("out");
        let first = pack(&[dir.path().join("model")], &FakeGgufTools, &options(&out))
            .await
            .unwrap();

        let mut opts = options(&out);
        opts.merge = true;
        let second = pack(&[dir.path().join("model")], &FakeGgufTools, &opts)
            .await
            .unwrap();
        assert!(second.written.is_empty());
        assert_eq!(second.deduped.len(), 2);
        assert_eq!(
            serde_json::to_value(&second.filemap.files).unwrap(),
            serde_json::to_value(&first.filemap.files).unwrap()
        );
    }

    #[tokio::test]
    async fn basename_collision_aborts_without_filemap() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join("model.bin"), b"contents-a").unwrap();
        std::fs::write(b.join("model.bin"), b"contents-b").unwrap();
        let out = dir.path().join("out");

        let err = pack(&[a, b], &FakeGgufTools, &options(&out))
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::Collision { .. }));
        assert!(!out.join(FILEMAP_NAME).exists());
    }

    #[tokio::test]
    async fn oversized_gguf_is_presplit_and_grouped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("model");
        std::fs::create_dir_all(&root).unwrap();
        let payload: Vec<u8> = (0..100u8).collect();
        std::fs::write(root.join("llm-Q4_K_M.gguf"), &payload).unwrap();
        std::fs::write(root.join("mmproj-f16.gguf"), vec![9u8; 20]).unwrap();
        std::fs::write(root.join("config.json"), b"{}").unwrap();

        let out = dir.path().join("out");
        let mut opts = options(&out);
        opts.gguf_shard_size = 40;
        let report = pack(&[root], &FakeGgufTools, &opts).await.unwrap();

        // 100 bytes over a 40-byte threshold: three runtime pieces, each
        // byte-split further at the 10-byte CDN cap.
        let filemap = &report.filemap;
        assert!(filemap.files.contains_key("model/llm-Q4_K_M-00001-of-00003.gguf"));
        assert!(filemap.files.contains_key("model/llm-Q4_K_M-00003-of-00003.gguf"));
        assert!(!filemap.files.contains_key("model/llm-Q4_K_M.gguf"));

        assert!(filemap.manifests.contains_key("Q4_K_M"));
        assert!(filemap.manifests.contains_key("mmproj_F16"));
        assert!(filemap.manifests.contains_key("Q4_K_M+mmproj_F16"));
        let bundle = &filemap.manifests["Q4_K_M+mmproj_F16"];
        assert!(bundle.files.contains(&"model/config.json".to_owned()));
        assert_eq!(bundle.size, 122);
        assert_eq!(
            filemap.gguf_metadata["model/llm-Q4_K_M.gguf"].kind.as_deref(),
            Some("llm")
        );

        // Round trip the multimodal bundle.
        let cache = tempfile::tempdir().unwrap();
        let resolver = DirectResolver::with_store(Arc::new(ShardStore::with_root(cache.path())));
        let source = Source::local("/m/", &out);
        let ropts = ResolveOptions {
            manifest: Some("Q4_K_M+mmproj_F16".into()),
            verify: true,
            ..Default::default()
        };
        let files = resolver.resolve_files(&source, &ropts).await.unwrap();
        let mut reassembled = Vec::new();
        for i in 1..=3 {
            let vp = format!("model/llm-Q4_K_M-{i:05}-of-00003.gguf");
            reassembled.extend_from_slice(&std::fs::read(&files[&vp]).unwrap());
        }
        assert_eq!(reassembled, payload);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let out = dir.path().join("out");
        let mut opts = options(&out);
        opts.dry_run = true;
        let report = pack(&[dir.path().join("model")], &FakeGgufTools, &opts)
            .await
            .unwrap();
        assert!(!out.exists());
        assert_eq!(report.filemap.files.len(), 2);
    }

    #[tokio::test]
    async fn rejects_gguf_shard_size_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut opts = options(&out);
        opts.gguf_shard_size = GGUF_SHARD_SIZE_CAP;
        let err = pack(&[dir.path().to_path_buf()], &FakeGgufTools, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidArgs(_)));
    }
}
