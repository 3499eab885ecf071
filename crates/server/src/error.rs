use thiserror::Error;

/// Failures reported by a token store or client registry backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,
    #[error("Record expired")]
    Expired,
    #[error("Record already exists")]
    Conflict,
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure says something about the presented credential
    /// rather than about the health of the backend.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, StoreError::NotFound | StoreError::Expired)
    }
}

/// Hard failures of an upstream credential source.
#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("Upstream network error: {0}")]
    Network(String),
    #[error("Upstream protocol error: {0}")]
    Protocol(String),
    #[error("Upstream timeout after {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure to produce random bytes from the operating system.
#[derive(Debug, Error)]
#[error("Random number generator failure: {0}")]
pub struct RandomError(pub String);

impl From<getrandom::Error> for RandomError {
    fn from(e: getrandom::Error) -> Self {
        RandomError(e.to_string())
    }
}
