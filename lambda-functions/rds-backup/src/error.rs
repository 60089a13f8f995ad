use thiserror::Error;

/// Raised by the configuration resolver before any network or storage call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not connect after {attempts} attempt(s): {cause:#}")]
    Exhausted { attempts: u32, cause: anyhow::Error },

    #[error("connect cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl ConnectError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// A failure while the export was being produced. Never retried within an invocation.
#[derive(Debug, Error)]
#[error("dump failed after {bytes_produced} bytes: {cause:#}")]
pub struct DumpError {
    pub bytes_produced: u64,
    pub cause: anyhow::Error,
}

impl DumpError {
    pub fn new(bytes_produced: u64, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            bytes_produced,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not initiate multipart upload for {key}: {cause:#}")]
    Initiate { key: String, cause: anyhow::Error },

    #[error("part {part_number} failed after {attempts} attempt(s): {cause:#}")]
    Part {
        part_number: i32,
        attempts: u32,
        cause: anyhow::Error,
    },

    #[error("upload exceeds the maximum of {max} parts")]
    TooManyParts { max: i32 },

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("could not finalize multipart upload: {cause:#}")]
    Finalize { cause: anyhow::Error },

    #[error("dump stream ended without an end-of-stream marker")]
    ProducerAborted,

    #[error("upload cancelled")]
    Cancelled,
}
