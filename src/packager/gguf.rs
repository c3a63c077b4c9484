//! GGUF handling at packaging time.
//!
//! Splitting an over-sized GGUF and reading its header are delegated to
//! external tools behind the [`GgufTools`] interface; the packager only
//! depends on the interface, so tests substitute their own implementation
//! and deployments point the environment at whatever llama.cpp build they
//! carry.

use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::utils::BoxFuture;

/// What the packager needs to know about a GGUF file to synthesize
/// manifests: text model or projector, and which quantization.
#[derive(Debug, Clone, Default)]
pub struct GgufInfo {
    pub architecture: Option<String>,
    pub quantization: Option<String>,
    /// True for multimodal projector models (`mmproj`).
    pub projector: bool,
}

pub trait GgufTools {
    /// Split `input` into same-format pieces of at most `max_size` bytes,
    /// named `{stem}-NNNNN-of-MMMMM.gguf` in `out_dir`. Returns the pieces
    /// in order.
    fn split<'a>(
        &'a self,
        input: &'a Path,
        out_dir: &'a Path,
        max_size: u64,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PathBuf>>>;

    /// Read architecture/quantization metadata from a GGUF header.
    fn read_metadata<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, anyhow::Result<GgufInfo>>;
}

/// The shell-tool implementation: llama.cpp's `llama-gguf-split` for
/// splitting, a `gguf-dump`-style header printer for metadata. Binaries are
/// overridable with `SHARDCAST_GGUF_SPLIT_BIN` / `SHARDCAST_GGUF_DUMP_BIN`.
pub struct CliGgufTools {
    split_bin: String,
    dump_bin: String,
}

impl CliGgufTools {
    pub fn new() -> Self {
        Self {
            split_bin: std::env::var("SHARDCAST_GGUF_SPLIT_BIN")
                .unwrap_or_else(|_| "llama-gguf-split".to_owned()),
            dump_bin: std::env::var("SHARDCAST_GGUF_DUMP_BIN")
                .unwrap_or_else(|_| "gguf-dump".to_owned()),
        }
    }
}

impl Default for CliGgufTools {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufTools for CliGgufTools {
    fn split<'a>(
        &'a self,
        input: &'a Path,
        out_dir: &'a Path,
        max_size: u64,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PathBuf>>> {
        Box::pin(async move {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".to_owned());
            let prefix = out_dir.join(&stem);
            let max_mib = (max_size / (1024 * 1024)).max(1);

            let status = tokio::process::Command::new(&self.split_bin)
                .arg("--split")
                .arg("--split-max-size")
                .arg(format!("{max_mib}M"))
                .arg(input)
                .arg(&prefix)
                .status()
                .await
                .with_context(|| format!("spawn {}", self.split_bin))?;
            if !status.success() {
                anyhow::bail!("{} exited with {status}", self.split_bin);
            }

            let mut pieces: Vec<PathBuf> = std::fs::read_dir(out_dir)
                .with_context(|| format!("read {}", out_dir.display()))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| {
                            let name = n.to_string_lossy();
                            name.starts_with(&stem) && split_group(&name).is_some()
                        })
                        .unwrap_or(false)
                })
                .collect();
            pieces.sort();
            if pieces.is_empty() {
                anyhow::bail!("{} produced no pieces for {}", self.split_bin, input.display());
            }
            Ok(pieces)
        })
    }

    fn read_metadata<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, anyhow::Result<GgufInfo>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(&self.dump_bin)
                .arg(path)
                .output()
                .await
                .with_context(|| format!("spawn {}", self.dump_bin))?;
            if !output.status.success() {
                anyhow::bail!("{} exited with {}", self.dump_bin, output.status);
            }
            let text = String::from_utf8_lossy(&output.stdout);

            let mut info = GgufInfo::default();
            for line in text.lines() {
                if line.contains("general.architecture") {
                    info.architecture = last_value_token(line);
                } else if line.contains("general.file_type") {
                    if let Some(token) = last_value_token(line) {
                        info.quantization = token
                            .parse::<u32>()
                            .ok()
                            .and_then(quant_from_file_type)
                            .map(str::to_owned)
                            .or(Some(token));
                    }
                }
            }
            info.projector = info.architecture.as_deref() == Some("clip")
                || text.contains("mmproj")
                || file_name_of(path).contains("mmproj");
            if info.quantization.is_none() {
                info.quantization = quant_from_name(&file_name_of(path));
            }
            Ok(info)
        })
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn last_value_token(line: &str) -> Option<String> {
    line.split(['=', ':'])
        .next_back()
        .map(|v| v.trim().trim_matches(['"', '\'']).to_owned())
        .filter(|v| !v.is_empty())
}

/// llama.cpp `general.file_type` values for the quantizations seen in
/// published models.
fn quant_from_file_type(file_type: u32) -> Option<&'static str> {
    Some(match file_type {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        32 => "BF16",
        _ => return None,
    })
}

/// If `name` is a pre-split GGUF piece (`{base}-NNNNN-of-MMMMM.gguf`),
/// return the logical name `{base}.gguf` it belongs to.
pub fn split_group(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".gguf")?;
    let (left, total) = stem.rsplit_once("-of-")?;
    if total.len() != 5 || !total.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (base, index) = left.rsplit_once('-')?;
    if index.len() != 5 || !index.chars().all(|c| c.is_ascii_digit()) || base.is_empty() {
        return None;
    }
    Some(format!("{base}.gguf"))
}

/// Best-effort quantization token from a file name, e.g.
/// `qwen2-vl-Q4_K_M.gguf` -> `Q4_K_M`.
pub fn quant_from_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".gguf").unwrap_or(name);
    stem.split(['-', '.'])
        .rev()
        .map(|token| token.to_ascii_uppercase())
        .find(|token| {
            let starts_q = token.starts_with('Q') || token.starts_with("IQ");
            let digits = token.chars().nth(if token.starts_with("IQ") { 2 } else { 1 });
            (starts_q && digits.map(|c| c.is_ascii_digit()).unwrap_or(false))
                || matches!(token.as_str(), "F16" | "F32" | "BF16")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_split_pieces() {
        assert_eq!(
            split_group("qwen-Q4_K_M-00001-of-00003.gguf").as_deref(),
            Some("qwen-Q4_K_M.gguf")
        );
        assert_eq!(split_group("qwen-Q4_K_M.gguf"), None);
        assert_eq!(split_group("model-123-of-456.gguf"), None);
        assert_eq!(split_group("weights.bin"), None);
    }

    #[test]
    fn extracts_quant_tokens() {
        assert_eq!(quant_from_name("qwen2-vl-Q4_K_M.gguf").as_deref(), Some("Q4_K_M"));
        assert_eq!(quant_from_name("mmproj-model-f16.gguf").as_deref(), Some("F16"));
        assert_eq!(quant_from_name("llama-iq2_xxs.gguf").as_deref(), Some("IQ2_XXS"));
        assert_eq!(quant_from_name("tokenizer.json"), None);
    }

    #[test]
    fn parses_dump_lines() {
        assert_eq!(
            last_value_token("      2: STRING     | general.architecture = \"qwen2\"").as_deref(),
            Some("qwen2")
        );
        assert_eq!(quant_from_file_type(15), Some("Q4_K_M"));
        assert_eq!(quant_from_file_type(999), None);
    }
}
