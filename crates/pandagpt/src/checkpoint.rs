use crate::{PandaGptError, PandaGptResult};
use candle_core::{Device, Tensor};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
// u64 header length followed by the opening brace of the JSON header
const SAFETENSORS_PROBE_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `torch.save` output, zip archive or legacy pickle
    Torch,
    Safetensors,
}

impl CheckpointFormat {
    pub fn detect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut magic = Vec::with_capacity(SAFETENSORS_PROBE_LEN);
        std::fs::File::open(path)?
            .take(SAFETENSORS_PROBE_LEN as u64)
            .read_to_end(&mut magic)?;

        if magic.starts_with(ZIP_MAGIC) {
            Ok(Self::Torch)
        } else if magic.get(SAFETENSORS_PROBE_LEN - 1) == Some(&b'{') {
            Ok(Self::Safetensors)
        } else {
            Ok(Self::Torch)
        }
    }
}

/// Read every tensor of a checkpoint onto the CPU, sorted by name.
pub fn load_state_dict(path: impl AsRef<Path>) -> PandaGptResult<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    let format = CheckpointFormat::detect(path).map_err(|e| PandaGptError::checkpoint(path, e))?;
    tracing::debug!("loading {:?} checkpoint {}", format, path.display());

    let mut tensors = match format {
        CheckpointFormat::Torch => candle_core::pickle::read_all(path),
        CheckpointFormat::Safetensors => {
            candle_core::safetensors::load(path, &Device::Cpu).map(|v| v.into_iter().collect())
        }
    }
    .map_err(|e| PandaGptError::checkpoint(path, e))?;

    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(tensors)
}

/// Outcome of a non-strict load: only keys known to both sides are loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model parameters the checkpoint does not provide.
    pub missing_keys: Vec<String>,
    /// Checkpoint entries the model has no parameter for.
    pub unexpected_keys: Vec<String>,
}

pub fn partition_non_strict(
    tensors: Vec<(String, Tensor)>,
    parameter_names: &[String],
) -> (Vec<(String, Tensor)>, LoadReport) {
    let known: BTreeSet<&str> = parameter_names.iter().map(String::as_str).collect();
    let mut report = LoadReport::default();
    let mut matching = vec![];

    for (name, tensor) in tensors {
        if known.contains(name.as_str()) {
            report.loaded.push(name.clone());
            matching.push((name, tensor));
        } else {
            report.unexpected_keys.push(name);
        }
    }

    let provided: BTreeSet<&str> = report.loaded.iter().map(String::as_str).collect();
    report.missing_keys = parameter_names
        .iter()
        .filter(|v| !provided.contains(v.as_str()))
        .cloned()
        .collect();

    (matching, report)
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::DType;
    use std::collections::HashMap;

    fn tensor() -> Tensor {
        Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_load_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        // delta checkpoints keep their `.pt` name whatever the encoding
        let path = dir.path().join("pytorch_model.pt");
        let tensors = HashMap::from([
            ("llama_proj.weight".to_string(), tensor()),
            ("llama_model.lora_A".to_string(), tensor()),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        assert_eq!(
            CheckpointFormat::detect(&path).unwrap(),
            CheckpointFormat::Safetensors
        );
        let loaded = load_state_dict(&path).unwrap();
        let names: Vec<_> = loaded.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["llama_model.lora_A", "llama_proj.weight"]);
        assert_eq!(loaded[0].1.dims(), &[2, 2]);
    }

    #[test]
    fn test_detect_torch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pytorch_model.pt");
        std::fs::write(&path, b"PK\x03\x04archive").unwrap();
        assert_eq!(
            CheckpointFormat::detect(&path).unwrap(),
            CheckpointFormat::Torch
        );
        assert!(matches!(
            load_state_dict(&path),
            Err(PandaGptError::CheckpointLoad { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let res = load_state_dict("/definitely/not/here.pt");
        assert!(matches!(
            res,
            Err(PandaGptError::CheckpointLoad { path, .. }) if path.ends_with("here.pt")
        ));
    }

    #[test]
    fn test_partition_non_strict() {
        let parameters = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let tensors = vec![
            ("a".to_string(), tensor()),
            ("c".to_string(), tensor()),
            ("z".to_string(), tensor()),
        ];

        let (matching, report) = partition_non_strict(tensors, &parameters);
        assert_eq!(matching.len(), 2);
        assert_eq!(report.loaded, ["a", "c"]);
        assert_eq!(report.missing_keys, ["b"]);
        assert_eq!(report.unexpected_keys, ["z"]);
    }
}
