use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Hash a file without pulling it into memory; model weights run to
/// gigabytes.
#[cfg(not(target_arch = "wasm32"))]
pub async fn sha256_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<String> {
    use anyhow::Context as _;
    use tokio::io::AsyncReadExt as _;

    let mut file = tokio::fs::File::open(path.as_ref())
        .await
        .context("tokio::fs::File::open failed")?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await.context("read failed")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
