use crate::placement::PlacementError;
use std::path::PathBuf;
use thiserror::Error;

pub type PandaGptResult<T> = std::result::Result<T, PandaGptError>;

#[derive(Error, Debug)]
pub enum PandaGptError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "Please first install PandaGPT and set the root path to use PandaGPT, \
         which is cloned from here: https://github.com/yxuansu/PandaGPT. \
         No usable PandaGPT code found at {}: {source}",
        .code_dir.display()
    )]
    DependencyMissing {
        code_dir: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load checkpoint {}: {source}", .path.display())]
    CheckpointLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Base model construction failed inside the runtime.
    #[error(transparent)]
    Build(anyhow::Error),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Format(#[from] ai::FormatError),

    #[error(transparent)]
    Generation(anyhow::Error),
}

impl PandaGptError {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::CheckpointLoad {
            path: path.into(),
            source: source.into(),
        }
    }
}
