use thiserror::Error;

use crate::slide::SlideId;

/// Failure of a single slide operation.
///
/// None of these stop the show; they are reported to whoever issued the
/// add/update/remove call and logged there.
#[derive(Debug, Error)]
pub enum SlideError {
    /// The bundle archive could not be downloaded or read.
    #[error("failed to fetch bundle for slide {id} from {url}: {reason}")]
    Fetch {
        id: SlideId,
        url: String,
        reason: String,
    },

    /// The archive was fetched but could not be unpacked.
    #[error("failed to extract bundle for slide {id}: {reason}")]
    Extract { id: SlideId, reason: String },

    /// The extracted bundle could not be turned into displayable content.
    #[error("failed to parse slide {id}: {reason}")]
    Parse { id: SlideId, reason: String },

    /// The bundle declares a mode the content loader cannot handle.
    #[error("slide {id} uses unsupported mode '{mode}'")]
    UnsupportedMode { id: SlideId, mode: String },

    /// Metadata sent by the remote side is unusable.
    #[error("invalid metadata for slide {id}: {reason}")]
    InvalidMetadata { id: SlideId, reason: String },

    /// A playlist item is malformed.
    #[error("invalid playlist item at position {position}: {reason}")]
    InvalidPlaylist { position: usize, reason: String },

    /// The slide stayed busy for every retry attempt.
    #[error("slide {id} still busy after {attempts} attempts")]
    LockTimeout { id: SlideId, attempts: u32 },

    /// The task running the operation panicked or was cancelled.
    #[error("operation on slide {id} aborted: {reason}")]
    Aborted { id: SlideId, reason: String },

    /// The show loop is gone (shutdown in progress).
    #[error("show loop is not running")]
    ShowClosed,
}

impl SlideError {
    pub fn fetch(id: &SlideId, url: &str, reason: impl ToString) -> Self {
        Self::Fetch {
            id: id.clone(),
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn extract(id: &SlideId, reason: impl ToString) -> Self {
        Self::Extract {
            id: id.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(id: &SlideId, reason: impl ToString) -> Self {
        Self::Parse {
            id: id.clone(),
            reason: reason.to_string(),
        }
    }
}
