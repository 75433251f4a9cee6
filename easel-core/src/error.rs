use thiserror::Error;

/// Failure taxonomy shared by both serving adapters.
///
/// The hosting layer maps these onto transport status: `InvalidInput` is the
/// caller's fault, `NotReady` means the pipeline has not finished loading and
/// `Pipeline` covers everything raised while loading weights or generating.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad operator configuration, detected before any model loading.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed request envelope.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Inference attempted before the pipeline finished loading.
    #[error("model is not ready")]
    NotReady,

    /// Anything raised by the pipeline or during weight loading.
    #[error(transparent)]
    Pipeline(#[from] anyhow::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for errors the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
