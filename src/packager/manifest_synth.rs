//! Manifest synthesis.
//!
//! After the file entries are in place, the packager names runnable
//! subsets. Explicit mode groups the whole run under one name. Auto mode
//! partitions by artifact family: ONNX variants by their `model_{token}`
//! naming, GGUF files per logical model classified as text model or
//! projector, with the cross product of text and projector quantizations
//! emitted for multimodal bundles. Files belonging to neither family
//! (tokenizers, configs) attach to every manifest. Runs with no
//! recognizable family emit no manifests at all and consumers fall back to
//! the full file set.

use std::collections::BTreeMap;

use crate::{
    filemap::{Filemap, GgufDescriptor},
    packager::gguf::{GgufInfo, quant_from_name},
};

/// What the packaging run contributes to synthesis.
#[derive(Debug, Default)]
pub struct SynthInput {
    /// Virtual paths added by this run.
    pub run_files: Vec<String>,
    /// Logical GGUF name -> (member virtual paths, header metadata).
    /// Pre-split pieces are grouped under one logical name.
    pub gguf_groups: BTreeMap<String, (Vec<String>, GgufInfo)>,
}

pub fn synthesize(filemap: &mut Filemap, input: &SynthInput, explicit: Option<&str>) {
    if let Some(name) = explicit {
        filemap.insert_manifest(name, input.run_files.clone());
        return;
    }

    let gguf_members: Vec<&String> = input
        .gguf_groups
        .values()
        .flat_map(|(vps, _)| vps)
        .collect();

    let mut onnx_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut shared: Vec<String> = Vec::new();
    for vp in &input.run_files {
        let basename = vp.rsplit('/').next().unwrap_or(vp);
        if let Some(token) = onnx_token(basename) {
            onnx_groups.entry(token).or_default().push(vp.clone());
        } else if !gguf_members.contains(&vp) {
            shared.push(vp.clone());
        }
    }

    // GGUF logical files by role and quantization.
    let mut llm: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut mmproj: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (base, (vps, info)) in &input.gguf_groups {
        let quant = info
            .quantization
            .clone()
            .or_else(|| quant_from_name(base))
            .unwrap_or_else(|| base.trim_end_matches(".gguf").to_owned());
        filemap.gguf_metadata.insert(
            base.clone(),
            GgufDescriptor {
                architecture: info.architecture.clone(),
                quantization: Some(quant.clone()),
                kind: Some(if info.projector { "mmproj" } else { "llm" }.to_owned()),
            },
        );
        let bucket = if info.projector { &mut mmproj } else { &mut llm };
        bucket.entry(quant).or_default().extend(vps.iter().cloned());
    }

    if onnx_groups.is_empty() && llm.is_empty() && mmproj.is_empty() {
        return;
    }

    let with_shared = |mut files: Vec<String>| {
        files.extend(shared.iter().cloned());
        files
    };

    for (token, files) in &onnx_groups {
        filemap.insert_manifest(token, with_shared(files.clone()));
    }

    for (quant, files) in &llm {
        filemap.insert_manifest(quant, with_shared(files.clone()));
    }
    for (quant, files) in &mmproj {
        filemap.insert_manifest(format!("mmproj_{quant}"), with_shared(files.clone()));
    }

    // Multimodal bundles: every text-model quant paired with every
    // projector quant. Some pairs may be architecturally invalid; pruning
    // is the publisher's call.
    if !llm.is_empty() && !mmproj.is_empty() {
        crate::warn!(
            "emitting {} multimodal manifest permutations; prune any invalid pairings before publishing",
            llm.len() * mmproj.len()
        );
        for (llm_quant, llm_files) in &llm {
            for (mm_quant, mm_files) in &mmproj {
                let mut files = llm_files.clone();
                files.extend(mm_files.iter().cloned());
                filemap.insert_manifest(format!("{llm_quant}+mmproj_{mm_quant}"), with_shared(files));
            }
        }
    }
}

/// The grouping token of an ONNX artifact: `model_{token}.onnx` and
/// `model_{token}.onnx_data` belong together. Unprefixed ONNX files group
/// under their own stem.
fn onnx_token(basename: &str) -> Option<String> {
    let stem = basename
        .strip_suffix(".onnx_data")
        .or_else(|| basename.strip_suffix(".onnx"))?;
    Some(stem.strip_prefix("model_").unwrap_or(stem).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemap::FileEntry;

    fn filemap_with(files: &[(&str, u64)]) -> Filemap {
        let mut filemap = Filemap::new();
        for (vp, size) in files {
            filemap.files.insert(
                (*vp).to_owned(),
                FileEntry::Unsharded {
                    size: *size,
                    sha256: "h".into(),
                    cdn_file: (*vp).to_owned(),
                },
            );
        }
        filemap
    }

    #[test]
    fn explicit_name_groups_the_run() {
        let mut filemap = filemap_with(&[("a.bin", 5), ("b.bin", 7)]);
        let input = SynthInput {
            run_files: vec!["a.bin".into(), "b.bin".into()],
            ..Default::default()
        };
        synthesize(&mut filemap, &input, Some("bundle"));
        assert_eq!(filemap.manifests.len(), 1);
        assert_eq!(filemap.manifests["bundle"].size, 12);
    }

    #[test]
    fn onnx_variants_group_by_token_with_shared_files() {
        let mut filemap = filemap_with(&[
            ("m/model_q4.onnx", 10),
            ("m/model_q4.onnx_data", 90),
            ("m/model_fp16.onnx", 200),
            ("m/tokenizer.json", 5),
        ]);
        let input = SynthInput {
            run_files: filemap.files.keys().cloned().collect(),
            ..Default::default()
        };
        synthesize(&mut filemap, &input, None);
        assert_eq!(
            filemap.manifests.keys().cloned().collect::<Vec<_>>(),
            vec!["fp16", "q4"]
        );
        assert_eq!(filemap.manifests["q4"].size, 105);
        assert!(filemap.manifests["fp16"].files.contains(&"m/tokenizer.json".to_owned()));
        filemap.validate().unwrap();
    }

    #[test]
    fn gguf_cross_product_for_multimodal() {
        let mut filemap = filemap_with(&[
            ("llm-Q4_K_M.gguf", 100),
            ("llm-Q8_0.gguf", 200),
            ("mmproj-f16.gguf", 50),
            ("config.json", 1),
        ]);
        let mut gguf_groups = BTreeMap::new();
        gguf_groups.insert(
            "llm-Q4_K_M.gguf".to_owned(),
            (
                vec!["llm-Q4_K_M.gguf".to_owned()],
                GgufInfo {
                    architecture: Some("qwen2".into()),
                    quantization: Some("Q4_K_M".into()),
                    projector: false,
                },
            ),
        );
        gguf_groups.insert(
            "llm-Q8_0.gguf".to_owned(),
            (
                vec!["llm-Q8_0.gguf".to_owned()],
                GgufInfo {
                    architecture: Some("qwen2".into()),
                    quantization: Some("Q8_0".into()),
                    projector: false,
                },
            ),
        );
        gguf_groups.insert(
            "mmproj-f16.gguf".to_owned(),
            (
                vec!["mmproj-f16.gguf".to_owned()],
                GgufInfo {
                    architecture: Some("clip".into()),
                    quantization: Some("F16".into()),
                    projector: true,
                },
            ),
        );
        let input = SynthInput {
            run_files: filemap.files.keys().cloned().collect(),
            gguf_groups,
        };
        synthesize(&mut filemap, &input, None);

        let names: Vec<_> = filemap.manifests.keys().cloned().collect();
        assert_eq!(
            names,
            vec![
                "Q4_K_M",
                "Q4_K_M+mmproj_F16",
                "Q8_0",
                "Q8_0+mmproj_F16",
                "mmproj_F16"
            ]
        );
        // Shared config rides along everywhere; sizes stay consistent.
        for manifest in filemap.manifests.values() {
            assert!(manifest.files.contains(&"config.json".to_owned()));
        }
        assert_eq!(filemap.manifests["Q4_K_M+mmproj_F16"].size, 151);
        assert_eq!(filemap.gguf_metadata["mmproj-f16.gguf"].kind.as_deref(), Some("mmproj"));
        filemap.validate().unwrap();
    }

    #[test]
    fn unrecognized_runs_emit_no_manifests() {
        let mut filemap = filemap_with(&[("weights.bin", 10), ("config.json", 1)]);
        let input = SynthInput {
            run_files: filemap.files.keys().cloned().collect(),
            ..Default::default()
        };
        synthesize(&mut filemap, &input, None);
        assert!(filemap.manifests.is_empty());
    }
}
