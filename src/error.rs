use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid hyperparameter combination.
    #[error("config error: {0}")]
    Config(String),

    /// Token id outside the embedding matrix, or tensors whose shapes disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Loss or accuracy evaluated to NaN/Inf.
    #[error("numeric error: {0}")]
    Numeric(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn numeric(msg: impl Into<String>) -> Self {
        Self::Numeric(msg.into())
    }
}
