use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use url::Url;

use crate::{
    constants::{DEFAULT_CHUNK_SIZE, DEFAULT_GGUF_SHARD_SIZE},
    packager::{CliGgufTools, PackOptions, pack},
    resolve::{DirectResolver, ResolveOptions},
    source::Source,
    store::ShardStore,
};

#[derive(Parser, Debug)]
#[command(name = "shardcast", version, about = "Sharded model-artifact delivery over size-capped CDNs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Package artifacts into CDN-sized shards plus a filemap.
    Pack {
        /// Input files or directory trees.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(long, short = 'o', help = "Output directory for shards and filemap.json")]
        out: PathBuf,

        #[arg(long, help = format!("Byte cap for a single CDN object. Default: {}", DEFAULT_CHUNK_SIZE))]
        chunk_size: Option<u64>,

        #[arg(long, help = "Additive run against an existing package; dedup by SHA-256")]
        merge: bool,

        #[arg(long, help = "Wipe an existing package first")]
        overwrite: bool,

        #[arg(long, help = "Group the whole run under one explicit manifest name")]
        manifest: Option<String>,

        #[arg(long, help = format!("GGUF pre-split threshold in bytes, strictly below 2 GiB. Default: {}", DEFAULT_GGUF_SHARD_SIZE))]
        gguf_shard_size: Option<u64>,

        #[arg(long, help = "Keep the GGUF pre-split work directory")]
        keep_intermediates: bool,

        #[arg(long, help = "Delete original GGUF inputs that were pre-split")]
        remove_originals: bool,

        #[arg(long = "exclude", help = "Glob pattern for file names to skip (repeatable)")]
        exclude: Vec<String>,

        #[arg(long, help = "Plan only; write nothing")]
        dry_run: bool,

        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Materialize logical files from a published package.
    Fetch {
        /// CDN base URL or local package directory.
        source: String,

        #[arg(long, short = 'o', help = "Target directory. Default: the shardcast cache")]
        out: Option<PathBuf>,

        #[arg(
            long = "manifest",
            help = "Manifest to fetch (repeatable; union of their file lists). Default: every file"
        )]
        manifests: Vec<String>,

        #[arg(long, help = "Verify each file against its filemap SHA-256")]
        verify: bool,

        #[arg(long, help = "List manifests and sizes instead of downloading")]
        list: bool,
    },
    /// Show what is in the local cache.
    List,
    /// Drop the shard cache and filemap memos.
    Clear,
}

fn dir_size(path: &std::path::Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                total += metadata.len();
            }
        }
    }
    total
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

fn parse_source(spec: &str) -> anyhow::Result<Source> {
    if spec.starts_with("http://") || spec.starts_with("https://") {
        let url = Url::parse(spec)?;
        Ok(Source::remote("/fetch/", url))
    } else {
        let path = PathBuf::from(spec);
        if !path.is_dir() {
            anyhow::bail!("source is neither a URL nor a directory: {spec}");
        }
        Ok(Source::local("/fetch/", path))
    }
}

pub async fn shardcast_cli(args: Vec<String>) -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Pack {
            inputs,
            out,
            chunk_size,
            merge,
            overwrite,
            manifest,
            gguf_shard_size,
            keep_intermediates,
            remove_originals,
            exclude,
            dry_run,
            verbose,
        } => {
            let mut opts = PackOptions::new(out);
            if let Some(chunk_size) = chunk_size {
                opts.chunk_size = chunk_size;
            }
            if let Some(gguf_shard_size) = gguf_shard_size {
                opts.gguf_shard_size = gguf_shard_size;
            }
            opts.merge = merge;
            opts.overwrite = overwrite;
            opts.manifest = manifest;
            opts.keep_intermediates = keep_intermediates;
            opts.remove_originals = remove_originals;
            opts.exclude = exclude;
            opts.dry_run = dry_run;
            opts.verbose = verbose;

            let report = pack(&inputs, &CliGgufTools::new(), &opts).await?;
            let action = if dry_run { "Would write" } else { "Wrote" };
            println!(
                "{action} {} CDN objects ({} deduped) for {} files into {}",
                report.written.len(),
                report.deduped.len(),
                report.filemap.files.len(),
                report.out_dir.display()
            );
            if !report.filemap.manifests.is_empty() {
                println!("Manifests:");
                for (name, manifest) in &report.filemap.manifests {
                    println!(
                        "* {:<32} {:>10.2} MB ({} files)",
                        name,
                        mb(manifest.size),
                        manifest.files.len()
                    );
                }
            }
        }
        Commands::Fetch {
            source,
            out,
            manifests,
            verify,
            list,
        } => {
            let source = parse_source(&source)?;
            let resolver = DirectResolver::new();

            if list {
                let filemap = resolver
                    .loader()
                    .load(&source)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no filemap at {}", source.key()))?;
                println!("{} files, {:.2} MB total", filemap.files.len(), mb(filemap.total_size()));
                if filemap.manifests.is_empty() {
                    println!("No manifests; consumers fall back to the full file set.");
                }
                for (name, manifest) in &filemap.manifests {
                    println!(
                        "* {:<32} {:>10.2} MB ({} files)",
                        name,
                        mb(manifest.size),
                        manifest.files.len()
                    );
                }
                return Ok(());
            }

            let selections: Vec<Option<String>> = if manifests.is_empty() {
                vec![None]
            } else {
                manifests.into_iter().map(Some).collect()
            };

            let pb_style = ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{wide_bar:.cyan/blue}] {pos}/{len} files")?
                .progress_chars("#>-");

            let mut out_dir = None;
            for manifest in selections {
                let pb = ProgressBar::new(0);
                pb.set_style(pb_style.clone());
                let pb_for_cb = pb.clone();
                let opts = ResolveOptions {
                    manifest: manifest.clone(),
                    verify,
                    out_dir: out.clone(),
                    on_progress: Some(Box::new(move |p| {
                        pb_for_cb.set_length(p.total as u64);
                        pb_for_cb.set_position(p.current as u64);
                        pb_for_cb.set_message(p.file.clone());
                    })),
                };
                let dir = resolver.resolve(&source, &opts).await?;
                pb.finish();
                out_dir = Some(dir);
            }
            if let Some(dir) = out_dir {
                println!("\nResolved into {}", dir.display());
            }
        }
        Commands::List => {
            let store = ShardStore::new();
            let root = store.root();
            println!("Cache root: {:?}", root);
            if !root.exists() {
                return Err(anyhow::anyhow!(
                    "Cache root directory does not exist: {:?}",
                    root
                ));
            }
            for (label, dir) in [
                ("shards", root.join("shards")),
                ("filemaps", root.join("filemaps")),
            ] {
                let count = std::fs::read_dir(&dir).map(|e| e.count()).unwrap_or(0);
                println!("* {:<10} {} entries, {:.2} MB", label, count, mb(dir_size(&dir)));
            }
            let resolved = root.join("resolved");
            if let Ok(entries) = std::fs::read_dir(&resolved) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        println!(
                            "* resolved/{} {:.2} MB",
                            entry.file_name().to_string_lossy(),
                            mb(dir_size(&path))
                        );
                    }
                }
            }
        }
        Commands::Clear => {
            let store = ShardStore::new();
            store.clear_cache().await;
            println!("Cache cleared: {:?}", store.root());
        }
    }

    Ok(())
}
