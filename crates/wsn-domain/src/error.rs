use thiserror::Error;
use wsn_payload::DecodeError;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid raw frame: {0}")]
    InvalidRawFrame(String),

    #[error("Invalid data record: {0}")]
    InvalidRecord(String),

    /// Transient failure of an external sink. Consumers back off and retry later.
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("State storage error: {0}")]
    Storage(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::DownstreamUnavailable(_))
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
