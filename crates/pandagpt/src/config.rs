use crate::{PandaGptError, PandaGptResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Once;

pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";

/// Per-device memory ceiling handed to the placement solver.
pub const MAX_MEMORY_PER_DEVICE: u64 = 32 * 1024 * 1024 * 1024;

/// Module classes whose internals must stay on one device.
pub const NO_SPLIT_MODULE_CLASSES: &[&str] = &["LlamaDecoderLayer", "VisionTransformer"];

pub const LM_HEAD_MODULE: &str = "llama_model.base_model.model.lm_head";
pub const PROJECTION_MODULE: &str = "llama_proj";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
pub enum ModelVariant {
    #[strum(serialize = "PandaGPT_13B")]
    PandaGpt13B,
}

impl ModelVariant {
    pub fn parse(name: &str) -> PandaGptResult<Self> {
        Self::from_str(name).map_err(|_| {
            PandaGptError::Configuration(format!(
                "unsupported model variant `{}`, expected `{}`",
                name,
                Self::PandaGpt13B
            ))
        })
    }
}

/// Construction arguments of the wrapped `openllama_peft` model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelArgs {
    pub model: String,
    pub imagebind_ckpt_path: PathBuf,
    pub vicuna_ckpt_path: PathBuf,
    pub delta_ckpt_path: PathBuf,
    pub stage: u32,
    pub max_tgt_len: usize,
    pub lora_r: usize,
    pub lora_alpha: usize,
    pub lora_dropout: f64,
}

impl ModelArgs {
    pub fn for_variant(variant: ModelVariant, root: impl AsRef<Path>) -> Self {
        let ckpt_dir = root.as_ref().join("pretrained_ckpt");
        match variant {
            ModelVariant::PandaGpt13B => Self {
                model: "openllama_peft".to_string(),
                imagebind_ckpt_path: ckpt_dir.join("imagebind_ckpt"),
                vicuna_ckpt_path: ckpt_dir.join("vicuna_ckpt").join("13b_v0"),
                delta_ckpt_path: ckpt_dir
                    .join("pandagpt_ckpt")
                    .join("13b")
                    .join("pytorch_model.pt"),
                stage: 2,
                max_tgt_len: 512,
                lora_r: 32,
                lora_alpha: 32,
                lora_dropout: 0.1,
            },
        }
    }

    pub fn checkpoint_paths(&self) -> [&Path; 3] {
        [
            &self.imagebind_ckpt_path,
            &self.vicuna_ckpt_path,
            &self.delta_ckpt_path,
        ]
    }
}

pub fn code_dir(root: impl AsRef<Path>) -> PathBuf {
    root.as_ref().join("code")
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PandaGptConfig {
    pub name: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Overrides merged onto the default generation parameters.
    #[serde(default)]
    pub generation: serde_json::Map<String, serde_json::Value>,
    /// Local process rank. Falls back to `LOCAL_RANK` when unset.
    #[serde(default)]
    pub rank: Option<usize>,
}

impl PandaGptConfig {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: Some(root.into()),
            ..Default::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> PandaGptResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            PandaGptError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            PandaGptError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    pub fn with_override(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.generation.insert(key.into(), value);
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn rank(&self) -> usize {
        self.rank.unwrap_or_else(local_rank_from_env)
    }

    pub fn variant(&self) -> PandaGptResult<ModelVariant> {
        ModelVariant::parse(&self.name)
    }

    /// A root without the PandaGPT code is reported when the code
    /// directory is resolved, not here.
    pub fn root(&self) -> PandaGptResult<&Path> {
        self.root.as_deref().ok_or_else(|| {
            PandaGptError::Configuration(
                "please set `root` to the PandaGPT directory cloned from https://github.com/yxuansu/PandaGPT"
                    .to_string(),
            )
        })
    }
}

static DOTENV: Once = Once::new();

/// Local process rank from the distributed launcher, 0 when unset.
pub fn local_rank_from_env() -> usize {
    DOTENV.call_once(|| {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("no .env loaded: {}", e);
        }
    });

    match std::env::var(LOCAL_RANK_ENV) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid {}={:?}, using 0", LOCAL_RANK_ENV, v);
            0
        }),
        Err(_) => 0,
    }
}
