use std::collections::BTreeMap;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, MapAccess, Visitor},
    ser::SerializeMap as _,
};

use crate::{constants::FILEMAP_VERSION, error::FilemapError};

/// One contiguous piece of a logical file, stored as its own CDN object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// CDN object name, e.g. `model.onnx_data.shard.003`.
    pub file: String,
    /// Byte offset of this shard within the reassembled logical file.
    pub offset: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Shard {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A single logical file in the filemap.
///
/// Exactly one storage shape applies: either the whole byte range lives in
/// one CDN object (`Unsharded`), or it is split into an ordered, contiguous
/// shard list (`Sharded`). `sha256` always covers the reassembled bytes,
/// never the individual shards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileEntry {
    Unsharded {
        size: u64,
        sha256: String,
        cdn_file: String,
    },
    Sharded {
        size: u64,
        sha256: String,
        shards: Vec<Shard>,
    },
}

impl FileEntry {
    pub fn size(&self) -> u64 {
        match self {
            FileEntry::Unsharded { size, .. } => *size,
            FileEntry::Sharded { size, .. } => *size,
        }
    }

    pub fn sha256(&self) -> &str {
        match self {
            FileEntry::Unsharded { sha256, .. } => sha256,
            FileEntry::Sharded { sha256, .. } => sha256,
        }
    }

    pub fn shards(&self) -> Option<&[Shard]> {
        match self {
            FileEntry::Unsharded { .. } => None,
            FileEntry::Sharded { shards, .. } => Some(shards),
        }
    }
}

impl Serialize for FileEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(3))?;
        match self {
            FileEntry::Unsharded {
                size,
                sha256,
                cdn_file,
            } => {
                map.serialize_entry("size", size)?;
                map.serialize_entry("sha256", sha256)?;
                map.serialize_entry("cdn_file", cdn_file)?;
            }
            FileEntry::Sharded {
                size,
                sha256,
                shards,
            } => {
                map.serialize_entry("size", size)?;
                map.serialize_entry("sha256", sha256)?;
                map.serialize_entry("shards", shards)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FileEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = FileEntry;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a file entry carrying either `cdn_file` or `shards`")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut size: Option<u64> = None;
                let mut sha256: Option<String> = None;
                let mut cdn_file: Option<String> = None;
                let mut shards: Option<Vec<Shard>> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "size" => size = Some(map.next_value()?),
                        "sha256" => sha256 = Some(map.next_value()?),
                        "cdn_file" => cdn_file = Some(map.next_value()?),
                        "shards" => shards = Some(map.next_value()?),
                        _ => {
                            map.next_value::<serde_json::Value>()?;
                        }
                    }
                }

                let size = size.ok_or_else(|| de::Error::missing_field("size"))?;
                let sha256 = sha256.ok_or_else(|| de::Error::missing_field("sha256"))?;
                match (cdn_file, shards) {
                    (Some(cdn_file), None) => Ok(FileEntry::Unsharded {
                        size,
                        sha256,
                        cdn_file,
                    }),
                    (None, Some(shards)) => Ok(FileEntry::Sharded {
                        size,
                        sha256,
                        shards,
                    }),
                    (Some(_), Some(_)) => Err(de::Error::custom(
                        "file entry carries both `cdn_file` and `shards`",
                    )),
                    (None, None) => Err(de::Error::custom(
                        "file entry carries neither `cdn_file` nor `shards`",
                    )),
                }
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

/// A named subset of virtual paths. `size` must equal the sum of the member
/// files' sizes; it is the denominator of progress reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub files: Vec<String>,
    pub size: u64,
}

/// Informational GGUF metadata recorded by the packager per logical base
/// name. Consumers use it for display only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GgufDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// The filemap document published alongside the shards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Filemap {
    pub version: u64,
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manifests: BTreeMap<String, ManifestEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gguf_metadata: BTreeMap<String, GgufDescriptor>,
}

impl Filemap {
    pub fn new() -> Self {
        Filemap {
            version: FILEMAP_VERSION,
            files: BTreeMap::new(),
            manifests: BTreeMap::new(),
            gguf_metadata: BTreeMap::new(),
        }
    }

    pub fn entry(&self, virtual_path: &str) -> Option<&FileEntry> {
        self.files.get(virtual_path)
    }

    /// Sum of all logical file sizes, the fallback progress denominator.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|e| e.size()).sum()
    }

    /// Parse and validate a filemap document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FilemapError> {
        let filemap: Filemap =
            serde_json::from_slice(bytes).map_err(|e| FilemapError::Json(e.to_string()))?;
        filemap.validate()?;
        Ok(filemap)
    }

    /// Enforce every published-filemap invariant.
    ///
    /// Shard lists must be contiguous from offset 0 and sum to the entry
    /// size; manifest sizes must agree with their member files; manifest
    /// members must exist. A violation rejects the whole document.
    pub fn validate(&self) -> Result<(), FilemapError> {
        if self.version != FILEMAP_VERSION {
            return Err(FilemapError::Version(self.version));
        }
        for (vp, entry) in &self.files {
            if let FileEntry::Sharded { size, shards, .. } = entry {
                if shards.is_empty() {
                    return Err(FilemapError::Schema(format!(
                        "{vp}: sharded entry with empty shard list"
                    )));
                }
                let mut expected_offset = 0u64;
                for shard in shards {
                    if shard.offset != expected_offset {
                        return Err(FilemapError::Schema(format!(
                            "{vp}: shard {} at offset {}, expected {}",
                            shard.file, shard.offset, expected_offset
                        )));
                    }
                    expected_offset += shard.size;
                }
                if expected_offset != *size {
                    return Err(FilemapError::Schema(format!(
                        "{vp}: shard sizes sum to {expected_offset}, entry says {size}"
                    )));
                }
            }
        }
        for (name, manifest) in &self.manifests {
            let mut sum = 0u64;
            for vp in &manifest.files {
                let entry = self.files.get(vp).ok_or_else(|| {
                    FilemapError::Schema(format!("manifest {name} references unknown file {vp}"))
                })?;
                sum += entry.size();
            }
            if sum != manifest.size {
                return Err(FilemapError::Schema(format!(
                    "manifest {name}: member sizes sum to {sum}, manifest says {}",
                    manifest.size
                )));
            }
        }
        Ok(())
    }

    /// Insert a manifest, computing its size from the member files.
    pub fn insert_manifest(&mut self, name: impl Into<String>, files: Vec<String>) {
        let size = files
            .iter()
            .filter_map(|vp| self.files.get(vp))
            .map(|e| e.size())
            .sum();
        self.manifests.insert(name.into(), ManifestEntry { files, size });
    }

    pub fn to_json_pretty(&self) -> Vec<u8> {
        // Serialization of plain string-keyed data cannot fail.
        let mut out = serde_json::to_vec_pretty(self).unwrap();
        out.push(b'\n');
        out
    }
}

impl Default for Filemap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sharded_doc() -> serde_json::Value {
        json!({
            "version": 5,
            "files": {
                "a.bin": {
                    "size": 25,
                    "sha256": "aa",
                    "shards": [
                        { "file": "a.bin.shard.000", "offset": 0, "size": 10 },
                        { "file": "a.bin.shard.001", "offset": 10, "size": 10 },
                        { "file": "a.bin.shard.002", "offset": 20, "size": 5 }
                    ]
                },
                "config.json": { "size": 7, "sha256": "bb", "cdn_file": "config.json" }
            },
            "manifests": {
                "full": { "files": ["a.bin", "config.json"], "size": 32 }
            }
        })
    }

    #[test]
    fn parses_both_entry_shapes() {
        let filemap: Filemap = serde_json::from_value(sharded_doc()).unwrap();
        filemap.validate().unwrap();
        assert_eq!(filemap.entry("a.bin").unwrap().shards().unwrap().len(), 3);
        assert!(filemap.entry("config.json").unwrap().shards().is_none());
        assert_eq!(filemap.total_size(), 32);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut doc = sharded_doc();
        doc["version"] = json!(4);
        let filemap: Filemap = serde_json::from_value(doc).unwrap();
        assert!(matches!(filemap.validate(), Err(FilemapError::Version(4))));
    }

    #[test]
    fn rejects_gapped_shards() {
        let mut doc = sharded_doc();
        doc["files"]["a.bin"]["shards"][1]["offset"] = json!(11);
        let filemap: Filemap = serde_json::from_value(doc).unwrap();
        assert!(matches!(filemap.validate(), Err(FilemapError::Schema(_))));
    }

    #[test]
    fn rejects_manifest_size_disagreement() {
        let mut doc = sharded_doc();
        doc["manifests"]["full"]["size"] = json!(33);
        let filemap: Filemap = serde_json::from_value(doc).unwrap();
        assert!(matches!(filemap.validate(), Err(FilemapError::Schema(_))));
    }

    #[test]
    fn rejects_entry_with_both_shapes() {
        let doc = json!({
            "size": 10,
            "sha256": "cc",
            "cdn_file": "x.bin",
            "shards": [{ "file": "x.bin.shard.000", "offset": 0, "size": 10 }]
        });
        assert!(serde_json::from_value::<FileEntry>(doc).is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let filemap: Filemap = serde_json::from_value(sharded_doc()).unwrap();
        let rehydrated = Filemap::from_slice(&filemap.to_json_pretty()).unwrap();
        assert_eq!(rehydrated.files, filemap.files);
        assert_eq!(rehydrated.manifests, filemap.manifests);
    }
}
