use crate::{PandaGptError, PandaGptResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type GenerationOverrides = serde_json::Map<String, serde_json::Value>;

/// Sampling parameters forwarded with every generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub top_p: f64,
    pub do_sample: bool,
    /// Maximum number of generated tokens.
    pub max_tgt_len: usize,
    pub temperature: f64,
    /// Override keys the adapter does not interpret, passed through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            top_p: 0.9,
            do_sample: false,
            max_tgt_len: 128,
            temperature: 0.001,
            extra: BTreeMap::new(),
        }
    }
}

impl GenerationParams {
    /// Defaults with `overrides` applied on top.
    pub fn from_overrides(overrides: &GenerationOverrides) -> PandaGptResult<Self> {
        Self::default().merged(overrides)
    }

    /// Apply `overrides`, later values winning. Merging the same overrides
    /// again yields the same parameters.
    pub fn merged(&self, overrides: &GenerationOverrides) -> PandaGptResult<Self> {
        let mut value = serde_json::to_value(self).map_err(|e| {
            PandaGptError::Configuration(format!("failed to encode generation params: {}", e))
        })?;

        if let serde_json::Value::Object(map) = &mut value {
            map.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        serde_json::from_value(value).map_err(|e| {
            PandaGptError::Configuration(format!("invalid generation override: {}", e))
        })
    }
}
