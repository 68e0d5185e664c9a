use super::AIModel;
use crate::Message;

#[derive(Debug, Clone)]
pub struct VisionLanguageInput {
    pub message: Message,
    // benchmark name, only forwarded for adapters that customize prompts per dataset
    pub dataset: Option<String>,
}

impl From<Message> for VisionLanguageInput {
    fn from(message: Message) -> Self {
        Self {
            message,
            dataset: None,
        }
    }
}

pub type VisionLanguageOutput = String;
pub type VisionLanguageModel = AIModel<VisionLanguageInput, VisionLanguageOutput>;
