//! Reassembly of logical files from their shards.

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};

use crate::{
    boxed,
    error::StoreError,
    filemap::{FileEntry, Shard},
    progress::ProgressHandle,
    resolver::payload::Payload,
    source::Source,
    store::ShardFetcher,
};

/// Stream the whole logical file, shard by shard, in declared order.
///
/// The logical file is never materialized: the payload carries a lazy
/// sequence of shard-sized buffers. `Content-Length` is the logical size.
pub fn read_full(
    fetcher: ShardFetcher,
    source: Source,
    rel_path: String,
    entry: FileEntry,
    progress: Option<ProgressHandle>,
) -> Payload {
    let size = entry.size();
    let sharded = entry.shards().is_some();
    let stream = boxed!(try_stream! {
        let _guard = match &progress {
            Some(p) => p.guard().await,
            None => None,
        };
        match entry {
            FileEntry::Unsharded { cdn_file, .. } => {
                let bytes = fetcher.read_shard(&source, &cdn_file).await?;
                if let Some(p) = &progress {
                    p.add_loaded(&rel_path, bytes.len() as u64).await;
                }
                yield bytes;
            }
            FileEntry::Sharded { shards, .. } => {
                for shard in shards {
                    let bytes = fetcher.read_shard(&source, &shard.file).await?;
                    if let Some(p) = &progress {
                        p.add_loaded(&rel_path, bytes.len() as u64).await;
                    }
                    yield bytes;
                }
            }
        }
    });
    Payload::stream(size, sharded, stream)
}

/// Serve `[start, end]` (inclusive) of the logical file.
///
/// Only the shards overlapping the window are touched. A shard covered
/// end-to-end is fetched whole (through the deduplicator, so it lands in
/// the cache); a partially covered shard is asked for just the slice, with
/// the store falling back to slicing in-process when the origin ignores
/// the range. The result buffer is assembled in offset order regardless of
/// fetch completion order.
pub async fn read_range(
    fetcher: ShardFetcher,
    source: Source,
    rel_path: String,
    entry: FileEntry,
    start: u64,
    end: u64,
    progress: Option<ProgressHandle>,
) -> Payload {
    let size = entry.size();
    if start >= size || start > end {
        return Payload::not_satisfiable(size);
    }
    let end = end.min(size - 1);

    let _guard = match &progress {
        Some(p) => p.guard().await,
        None => None,
    };

    let result = match &entry {
        FileEntry::Unsharded { cdn_file, .. } => fetcher
            .store()
            .read_shard_range(&source, cdn_file, start, end)
            .await,
        FileEntry::Sharded { shards, .. } => {
            read_sharded_range(&fetcher, &source, shards, start, end).await
        }
    };

    match result {
        Ok(bytes) => {
            if let Some(p) = &progress {
                p.add_loaded(&rel_path, bytes.len() as u64).await;
            }
            Payload::partial(start, end, size, bytes)
        }
        Err(e) => Payload::internal_error(e),
    }
}

async fn read_sharded_range(
    fetcher: &ShardFetcher,
    source: &Source,
    shards: &[Shard],
    start: u64,
    end: u64,
) -> Result<Bytes, StoreError> {
    // Minimal prefix-suffix of the shard list covering [start, end].
    let covered: Vec<&Shard> = shards
        .iter()
        .filter(|s| s.end() > start && s.offset <= end)
        .collect();

    let reads = covered.iter().map(|shard| {
        let local_start = start.max(shard.offset) - shard.offset;
        let local_end = end.min(shard.end() - 1) - shard.offset;
        let whole = local_start == 0 && local_end == shard.size - 1;
        async move {
            if whole {
                fetcher.read_shard(source, &shard.file).await
            } else {
                fetcher
                    .store()
                    .read_shard_range(source, &shard.file, local_start, local_end)
                    .await
            }
        }
    });

    // try_join_all keeps input order, so the concatenation is in offset
    // order even when the fetches finish out of order.
    let slices = futures::future::try_join_all(reads).await?;
    let mut buf = BytesMut::with_capacity((end - start + 1) as usize);
    for slice in slices {
        buf.extend_from_slice(&slice);
    }
    Ok(buf.freeze())
}
