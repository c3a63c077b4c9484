use std::path::PathBuf;

use sha2::{Digest, Sha256};
use url::Url;

/// Where a source's shards and `filemap.json` live.
#[derive(Debug, Clone)]
pub enum SourceBase {
    /// A URL root on a CDN. Shard `x` is fetched from `{base}/x`.
    Remote(Url),
    /// A flat local directory, typically the output of the packager.
    Local(PathBuf),
}

/// A registered delivery source.
///
/// `path_prefix` is the logical URL prefix under which runtime reads appear;
/// everything after the prefix is a virtual path looked up in the source's
/// filemap. At most one of remote/local backing is held, by construction.
#[derive(Debug, Clone)]
pub struct Source {
    path_prefix: String,
    pub base: SourceBase,
    /// Fixes the progress denominator up front when the embedder already
    /// knows which manifest it will load.
    pub manifest: Option<String>,
    /// Whether progress events are emitted for this source.
    pub progress: bool,
}

impl Source {
    pub fn remote(path_prefix: impl AsRef<str>, base: Url) -> Self {
        Self {
            path_prefix: canonicalize_prefix(path_prefix.as_ref()),
            base: SourceBase::Remote(base),
            manifest: None,
            progress: false,
        }
    }

    pub fn local(path_prefix: impl AsRef<str>, base: impl Into<PathBuf>) -> Self {
        Self {
            path_prefix: canonicalize_prefix(path_prefix.as_ref()),
            base: SourceBase::Local(base.into()),
            manifest: None,
            progress: false,
        }
    }

    pub fn with_manifest(mut self, manifest: Option<String>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// The canonical prefix, always ending in `/`.
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Stable identity of the backing, used as the memoization key for
    /// filemap loads and as input to cache-directory derivation.
    pub fn key(&self) -> String {
        match &self.base {
            SourceBase::Remote(url) => url.as_str().trim_end_matches('/').to_owned(),
            SourceBase::Local(path) => path.to_string_lossy().trim_end_matches('/').to_owned(),
        }
    }

    /// First `n` hex chars of SHA-256 over the source key.
    pub fn key_hash(&self, n: usize) -> String {
        let digest = Sha256::digest(self.key().as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(n);
        hash
    }

    /// Absolute location of a named object under this source's base.
    pub fn object_url(&self, name: &str) -> String {
        match &self.base {
            SourceBase::Remote(url) => {
                format!("{}/{}", url.as_str().trim_end_matches('/'), name)
            }
            SourceBase::Local(path) => path.join(name).to_string_lossy().into_owned(),
        }
    }

    /// Match a request path against this source.
    ///
    /// Returns the non-empty remainder after the prefix, or `None` when the
    /// path is outside this source (or names the prefix itself).
    pub fn match_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rel = path.strip_prefix(self.path_prefix.as_str())?;
        if rel.is_empty() { None } else { Some(rel) }
    }
}

fn canonicalize_prefix(prefix: &str) -> String {
    let mut p = prefix.to_owned();
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    if !p.ends_with('/') {
        p.push('/');
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_canonicalized() {
        let src = Source::local("models/llm", "/tmp/pkg");
        assert_eq!(src.path_prefix(), "/models/llm/");
    }

    #[test]
    fn match_requires_nonempty_suffix() {
        let src = Source::local("/models/", "/tmp/pkg");
        assert_eq!(src.match_path("/models/a/b.bin"), Some("a/b.bin"));
        assert_eq!(src.match_path("/models/"), None);
        assert_eq!(src.match_path("/other/a.bin"), None);
    }

    #[test]
    fn key_hash_is_stable() {
        let src = Source::remote("/m/", Url::parse("https://cdn.example.com/pkg").unwrap());
        assert_eq!(src.key_hash(12), &src.key_hash(16)[..12]);
        assert_eq!(src.key_hash(12).len(), 12);
    }
}
