use std::path::Path;

use anyhow::Context as _;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::filemap::Shard;

/// Byte-split `input` into fixed-size shards named `{basename}.shard.NNN`
/// in `out_dir`, recording offset, size and per-shard SHA-256. The last
/// shard may be shorter. With `dry_run` nothing is written but the shard
/// plan (offsets, sizes, hashes) is still produced.
pub async fn split_file(
    input: &Path,
    basename: &str,
    out_dir: &Path,
    chunk_size: u64,
    dry_run: bool,
) -> anyhow::Result<Vec<Shard>> {
    let mut file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("open {}", input.display()))?;

    let mut shards = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;
    let mut buf = vec![0u8; 1024 * 1024];

    loop {
        // Fill one shard's worth, or less at the tail.
        let mut hasher = Sha256::new();
        let shard_name = format!("{basename}.shard.{index:03}");
        let mut written = 0u64;
        let mut out = if dry_run {
            None
        } else {
            Some(
                tokio::fs::File::create(out_dir.join(&shard_name))
                    .await
                    .with_context(|| format!("create {shard_name}"))?,
            )
        };

        while written < chunk_size {
            let want = buf.len().min((chunk_size - written) as usize);
            let n = file.read(&mut buf[..want]).await.context("read failed")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if let Some(out) = out.as_mut() {
                out.write_all(&buf[..n]).await.context("write failed")?;
            }
            written += n as u64;
        }
        if let Some(mut out) = out.take() {
            out.flush().await.context("flush failed")?;
        }

        if written == 0 {
            // Nothing read: remove the empty trailing shard.
            if !dry_run {
                let _ = tokio::fs::remove_file(out_dir.join(&shard_name)).await;
            }
            break;
        }

        shards.push(Shard {
            file: shard_name,
            offset,
            size: written,
            sha256: Some(hex::encode(hasher.finalize())),
        });
        offset += written;
        index += 1;
        if written < chunk_size {
            break;
        }
    }
    Ok(shards)
}
