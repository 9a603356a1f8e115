//! Error types for photong.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// The first four variants are the synthesis failure kinds; they propagate
/// unchanged from the sampler and codec up to whoever called the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The generative model context could not be acquired (missing weights,
    /// tokenizer, or device init failure).
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Numerical failure during conditioned sampling (divergence, NaN output).
    #[error("sampling failed: {0}")]
    SamplingFailed(String),

    /// Spectrogram dimensions inconsistent with the configured parameters.
    #[error("spectrogram shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Waveform could not be compressed into the output container.
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    /// A caller-supplied deadline passed before the next interpolation step.
    #[error("deadline exceeded before interpolation step {step}")]
    DeadlineExceeded { step: usize },

    /// A seed image asset exists but could not be read.
    #[error("asset: {0}")]
    Asset(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// The synthesis manager has shut down or dropped a request.
    #[error("manager: {0}")]
    Manager(String),

    /// Captioning or text-completion service failure.
    #[error("collaborator: {0}")]
    Collaborator(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::EncodingFailed(error.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(error: image::ImageError) -> Self {
        Error::Asset(error.to_string())
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::ModelUnavailable(format!("tokenizer: {error}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Collaborator(error.to_string())
    }
}
