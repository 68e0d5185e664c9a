use crate::params::GenerationParams;
use ai::PromptImage;
use serde::Serialize;
use std::path::PathBuf;

/// Input handed to the wrapped model's `generate`, built fresh per call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image_paths: Vec<PathBuf>,
    pub audio_paths: Vec<PathBuf>,
    pub video_paths: Vec<PathBuf>,
    pub thermal_paths: Vec<PathBuf>,
    pub modality_embeds: Vec<Vec<f32>>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(input: PromptImage, params: GenerationParams) -> Self {
        Self {
            prompt: input.prompt,
            image_paths: input.image.into_iter().collect(),
            audio_paths: vec![],
            video_paths: vec![],
            thermal_paths: vec![],
            modality_embeds: vec![],
            params,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_layout() {
        let request = GenerationRequest::new(
            PromptImage {
                prompt: "Describe this image.".into(),
                image: Some("/data/cat.jpg".into()),
            },
            GenerationParams::default(),
        );

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "prompt": "Describe this image.",
                "image_paths": ["/data/cat.jpg"],
                "audio_paths": [],
                "video_paths": [],
                "thermal_paths": [],
                "modality_embeds": [],
                "top_p": 0.9,
                "do_sample": false,
                "max_tgt_len": 128,
                "temperature": 0.001,
            })
        );

        let request = GenerationRequest::new(
            PromptImage {
                prompt: "hi".into(),
                image: None,
            },
            GenerationParams::default(),
        );
        assert!(request.image_paths.is_empty());
    }
}
