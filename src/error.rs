use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("annotation {client_id} has malformed geometry: {reason}")]
    Geometry { client_id: String, reason: String },

    #[error("could not resolve persisted annotation metadata: {0}")]
    Resolution(String),

    #[error("{action} failed: {detail}")]
    Persistence { action: String, detail: String },

    #[error("viewport {0} has no enabled rendering element")]
    EngineAbsent(usize),

    #[error("result for viewport {viewport} arrived for generation {got}, binding is at {current}")]
    Stale {
        viewport: usize,
        got: u64,
        current: u64,
    },

    #[error("{0}")]
    InvalidTransition(String),

    #[error("series rejected for viewport {viewport}: {reason}")]
    AssignmentRejected { viewport: usize, reason: String },

    #[error("unknown segmentation layer {0}")]
    UnknownLayer(u64),

    #[error("viewport index {0} is outside the current layout")]
    ViewportOutOfRange(usize),

    #[error("malformed drag payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ViewerError {
    pub fn persistence(action: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Persistence {
            action: action.into(),
            detail: format!("{err:#}"),
        }
    }

    /// Only persistence failures are shown to the user; everything else is logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

pub type ViewerResult<T> = std::result::Result<T, ViewerError>;
