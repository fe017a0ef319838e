use std::path::PathBuf;

use crate::lane::LaneKind;

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// Terminal outcomes of a transcode run. None of them is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// Bad path, unreadable container, no video stream or no usable decoder.
    #[error("cannot open source {}", path.display())]
    SourceOpen {
        path: PathBuf,
        source: anyhow::Error,
    },

    /// The destination file, the muxer or one of its encoders could not be set up.
    #[error("cannot create output {}", path.display())]
    OutputCreate {
        path: PathBuf,
        source: anyhow::Error,
    },

    /// The processing function returned no image.
    #[error("processing function returned no image for frame at pts {pts:?}")]
    TransformFailure { pts: Option<i64> },

    /// Decode, encode or mux error while a lane was running.
    #[error("{lane} lane failed")]
    Lane {
        lane: LaneKind,
        source: anyhow::Error,
    },

    #[error("cannot finalize output {}", path.display())]
    Finalize {
        path: PathBuf,
        source: anyhow::Error,
    },

    /// The pipeline went away without reporting (runtime shut down mid-run).
    #[error("transcode ended without reporting a result")]
    Dropped,
}

impl TranscodeError {
    pub fn lane(lane: LaneKind, source: impl Into<anyhow::Error>) -> Self {
        Self::Lane {
            lane,
            source: source.into(),
        }
    }

    pub fn is_transform_failure(&self) -> bool {
        matches!(self, Self::TransformFailure { .. })
    }
}
