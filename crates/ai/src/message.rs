use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One item of a multimodal message, serialized as `{"type": ..., "value": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageContent {
    Text(String),
    Image(PathBuf),
    Audio(PathBuf),
    Video(PathBuf),
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("message has no content")]
    Empty,

    #[error("at most one image is supported, got {0}")]
    TooManyImages(usize),

    #[error("unsupported content type: {0}")]
    UnsupportedContent(&'static str),
}

/// Text prompt plus the optional single image, as consumed by
/// adapters that do not support interleaved input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptImage {
    pub prompt: String,
    pub image: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Vec<MessageContent>);

impl Message {
    pub fn new(contents: Vec<MessageContent>) -> Self {
        Self(contents)
    }

    /// Build a message from bare strings: an existing file with an image
    /// extension becomes an image, anything else is text.
    pub fn from_strings<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let contents = inputs
            .into_iter()
            .map(|v| {
                let v: String = v.into();
                if is_image_file(Path::new(&v)) {
                    MessageContent::Image(PathBuf::from(v))
                } else {
                    MessageContent::Text(v)
                }
            })
            .collect();

        Self(contents)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.0.push(MessageContent::Text(text.into()));
        self
    }

    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.0.push(MessageContent::Image(path.into()));
        self
    }

    pub fn contents(&self) -> &[MessageContent] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn images(&self) -> impl Iterator<Item = &Path> {
        self.0.iter().filter_map(|v| match v {
            MessageContent::Image(p) => Some(p.as_path()),
            _ => None,
        })
    }

    /// Collapse the message into one prompt and at most one image.
    ///
    /// Texts are joined with a newline in message order.
    pub fn to_prompt_image(&self) -> Result<PromptImage, FormatError> {
        if self.0.is_empty() {
            return Err(FormatError::Empty);
        }

        if let Some(unsupported) = self
            .0
            .iter()
            .find(|v| !matches!(v, MessageContent::Text(_) | MessageContent::Image(_)))
        {
            return Err(FormatError::UnsupportedContent(unsupported.kind()));
        }

        let mut images = self.images();
        let image = images.next().map(Path::to_path_buf);
        let extra = images.count();
        if extra > 0 {
            return Err(FormatError::TooManyImages(extra + 1));
        }

        let prompt = self
            .0
            .iter()
            .filter_map(|v| match v {
                MessageContent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(PromptImage { prompt, image })
    }
}

impl From<Vec<MessageContent>> for Message {
    fn from(contents: Vec<MessageContent>) -> Self {
        Self(contents)
    }
}

fn is_image_file(path: &Path) -> bool {
    path.is_file() && image::ImageFormat::from_path(path).is_ok()
}
