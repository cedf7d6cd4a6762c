pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error")]
    Crypto,

    #[error("storage upload failed (provider={provider}, status={status_code:?}): {message}")]
    Storage {
        provider: String,
        status_code: Option<u16>,
        message: String,
    },

    #[error("remote transfer api error: {message}")]
    Remote { message: String },

    #[error("upload attempt timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("upload pipeline shut down: {message}")]
    Shutdown { message: String },

    #[error("failed to upload {source_name} (file_id={file_id})")]
    UploadFailed {
        source_name: String,
        file_id: String,
        #[source]
        cause: Box<Error>,
    },
}

impl Error {
    /// Whether a retry policy may try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Storage { .. } | Error::Remote { .. } | Error::Timeout { .. }
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Storage { status_code, .. } => *status_code,
            _ => None,
        }
    }
}
