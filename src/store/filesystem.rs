//! Durable byte storage behind one facade: plain files on native targets,
//! OPFS inside the browser.

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::path::Path;

    use anyhow::{Context, bail};
    use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

    pub async fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    pub async fn file_size(path: impl AsRef<Path>) -> anyhow::Result<u64> {
        let meta = tokio::fs::metadata(path)
            .await
            .context("tokio::fs::metadata failed")?;
        Ok(meta.len())
    }

    pub async fn read(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        tokio::fs::read(path).await.context("tokio::fs::read failed")
    }

    /// Read `[start, end]` (inclusive) from a file without loading the rest.
    pub async fn read_range(
        path: impl AsRef<Path>,
        start: u64,
        end: u64,
    ) -> anyhow::Result<Vec<u8>> {
        if end < start {
            bail!("invalid range {start}-{end}");
        }
        let mut file = tokio::fs::File::open(path)
            .await
            .context("tokio::fs::File::open failed")?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .context("seek failed")?;
        let len = (end - start + 1) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await.context("read_exact failed")?;
        Ok(buf)
    }

    pub async fn write(
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
        create_parent: bool,
    ) -> anyhow::Result<()> {
        if create_parent {
            if let Some(parent) = path.as_ref().parent() {
                if !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("tokio::fs::create_dir_all failed")?;
                }
            }
        }
        tokio::fs::write(path, data)
            .await
            .context("tokio::fs::write failed")
    }

    /// Write `data` at `offset`, creating or growing the file as needed.
    /// Used for resumable reassembly: shards land at their declared offsets.
    pub async fn write_at(
        path: impl AsRef<Path>,
        offset: u64,
        data: impl AsRef<[u8]>,
    ) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("tokio::fs::create_dir_all failed")?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await
            .context("tokio::fs::OpenOptions::open failed")?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .context("seek failed")?;
        file.write_all(data.as_ref()).await.context("write_all failed")?;
        file.flush().await.context("flush failed")?;
        Ok(())
    }

    pub async fn remove(path: impl AsRef<Path>) -> anyhow::Result<()> {
        if path.as_ref().is_dir() {
            tokio::fs::remove_dir_all(path)
                .await
                .context("tokio::fs::remove_dir_all failed")
        } else if path.as_ref().is_file() {
            tokio::fs::remove_file(path)
                .await
                .context("tokio::fs::remove_file failed")
        } else {
            bail!(
                "Neither directory nor file: {}",
                path.as_ref().as_os_str().to_string_lossy()
            )
        }
    }
}

#[cfg(target_arch = "wasm32")]
mod opfs {
    use std::path::{Component, Path};

    use anyhow::{anyhow, bail};
    use js_sys::{Reflect, Uint8Array};
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;
    use web_sys::{
        FileSystemDirectoryHandle, FileSystemFileHandle, FileSystemGetDirectoryOptions,
        FileSystemGetFileOptions, FileSystemRemoveOptions, FileSystemWritableFileStream,
        StorageManager,
    };

    /// Await a browser promise and cast the settled value, folding the two
    /// failure modes (rejection, wrong type) into one diagnostic.
    async fn js_await<T: JsCast>(promise: js_sys::Promise, what: &str) -> anyhow::Result<T> {
        let settled = JsFuture::from(promise)
            .await
            .map_err(|e| anyhow!("{what}: {e:?}"))?;
        settled
            .dyn_into::<T>()
            .map_err(|_| anyhow!("{what}: unexpected result type"))
    }

    /// `navigator.storage`, wherever this code runs. Window and worker
    /// scopes expose the same property, so a `Reflect` lookup on the global
    /// avoids caring which kind of scope we are in.
    fn storage_manager() -> anyhow::Result<StorageManager> {
        let navigator = Reflect::get(&js_sys::global(), &JsValue::from_str("navigator"))
            .map_err(|_| anyhow!("no navigator in this scope"))?;
        Reflect::get(&navigator, &JsValue::from_str("storage"))
            .ok()
            .and_then(|s| s.dyn_into::<StorageManager>().ok())
            .ok_or_else(|| anyhow!("navigator.storage unavailable"))
    }

    fn leaf_name(path: &Path) -> anyhow::Result<String> {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))
    }

    /// Walk from the OPFS root to the directory containing `path`.
    async fn parent_dir(path: &Path, create: bool) -> anyhow::Result<FileSystemDirectoryHandle> {
        let Some(parent) = path.parent() else {
            bail!("refusing to operate on the OPFS root");
        };
        let mut dir: FileSystemDirectoryHandle =
            js_await(storage_manager()?.get_directory(), "OPFS root").await?;
        for component in parent.components() {
            let Component::Normal(segment) = component else {
                continue;
            };
            let opts = FileSystemGetDirectoryOptions::new();
            opts.set_create(create);
            let promise = dir.get_directory_handle_with_options(&segment.to_string_lossy(), &opts);
            dir = js_await(promise, "directory handle").await?;
        }
        Ok(dir)
    }

    async fn open_file(path: &Path, create: bool) -> anyhow::Result<FileSystemFileHandle> {
        let dir = parent_dir(path, create).await?;
        let opts = FileSystemGetFileOptions::new();
        opts.set_create(create);
        js_await(dir.get_file_handle_with_options(&leaf_name(path)?, &opts), "file handle").await
    }

    /// An immutable snapshot of the file's current contents.
    async fn snapshot(path: &Path) -> anyhow::Result<web_sys::File> {
        let handle = open_file(path, false).await?;
        js_await(handle.get_file(), "file snapshot").await
    }

    async fn blob_bytes(blob: &web_sys::Blob) -> anyhow::Result<Vec<u8>> {
        let buffer = JsFuture::from(blob.array_buffer())
            .await
            .map_err(|e| anyhow!("reading blob: {e:?}"))?;
        Ok(Uint8Array::new(&buffer).to_vec())
    }

    pub async fn exists(path: impl AsRef<Path>) -> bool {
        open_file(path.as_ref(), false).await.is_ok()
    }

    pub async fn file_size(path: impl AsRef<Path>) -> anyhow::Result<u64> {
        Ok(snapshot(path.as_ref()).await?.size() as u64)
    }

    pub async fn read(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        blob_bytes(&snapshot(path.as_ref()).await?).await
    }

    /// Read `[start, end]` (inclusive). `Blob::slice` keeps the copy across
    /// the JS boundary down to the requested window.
    pub async fn read_range(
        path: impl AsRef<Path>,
        start: u64,
        end: u64,
    ) -> anyhow::Result<Vec<u8>> {
        if end < start {
            bail!("invalid range {start}-{end}");
        }
        let file = snapshot(path.as_ref()).await?;
        let slice = file
            .slice_with_f64_and_f64(start as f64, (end + 1) as f64)
            .map_err(|e| anyhow!("slicing blob: {e:?}"))?;
        blob_bytes(&slice).await
    }

    pub async fn write(
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
        create_parent: bool,
    ) -> anyhow::Result<()> {
        let handle = open_file(path.as_ref(), create_parent).await?;
        let sink: FileSystemWritableFileStream =
            js_await(handle.create_writable(), "writable stream").await?;
        let pending = sink
            .write_with_u8_array(data.as_ref())
            .map_err(|e| anyhow!("starting write: {e:?}"))?;
        JsFuture::from(pending)
            .await
            .map_err(|e| anyhow!("writing: {e:?}"))?;
        JsFuture::from(sink.close())
            .await
            .map_err(|e| anyhow!("closing writable stream: {e:?}"))?;
        Ok(())
    }

    pub async fn remove(path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let dir = parent_dir(path, false).await?;
        let opts = FileSystemRemoveOptions::new();
        opts.set_recursive(true);
        JsFuture::from(dir.remove_entry_with_options(&leaf_name(path)?, &opts))
            .await
            .map_err(|e| anyhow!("removing {}: {e:?}", path.display()))?;
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::*;
#[cfg(target_arch = "wasm32")]
pub use opfs::*;
