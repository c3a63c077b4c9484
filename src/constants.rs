/// Schema version of the filemap document. Loaders refuse any other value.
pub const FILEMAP_VERSION: u64 = 5;

/// Name of the filemap document inside a package directory or CDN namespace.
pub const FILEMAP_NAME: &str = "filemap.json";

/// Default byte cap for a single CDN object. Files larger than this are
/// split into `{basename}.shard.NNN` pieces at packaging time.
pub const DEFAULT_CHUNK_SIZE: u64 = 19 * 1024 * 1024;

/// Default threshold above which a GGUF input is pre-split with the external
/// splitter before byte-splitting.
pub const DEFAULT_GGUF_SHARD_SIZE: u64 = 1800 * 1024 * 1024;

/// Hard upper bound for `--gguf-shard-size`. Downstream GGUF runtimes reject
/// pieces of 2 GiB or more, so the configured value must stay strictly below.
pub const GGUF_SHARD_SIZE_CAP: u64 = 2 * 1024 * 1024 * 1024;

/// Minimum interval between two progress broadcasts for one source.
pub const PROGRESS_THROTTLE_MS: u64 = 250;

/// Silence interval after the last in-flight fetch before an adaptive or
/// fallback source is finalized.
pub const IDLE_FINALIZE_MS: u64 = 2000;

pub const SHARDCAST_VERSION: &str = env!("CARGO_PKG_VERSION");
