use std::fmt;

#[derive(Debug)]
pub struct RelayError {
    code: &'static str,
    message: String,
}

impl RelayError {
    pub const RESOLUTION_FAILED: &'static str = "RESOLUTION_FAILED";
    pub const UNKNOWN_FUNCTION: &'static str = "UNKNOWN_FUNCTION";
    pub const PAGE_NOT_BOUND: &'static str = "PAGE_NOT_BOUND";
    pub const BUFFER_UNAVAILABLE: &'static str = "BUFFER_UNAVAILABLE";

    fn new(code: &'static str, message: String) -> Self {
        Self { code, message }
    }

    pub fn resolution(message: String) -> Self {
        Self::new(Self::RESOLUTION_FAILED, message)
    }

    pub fn buffer_unavailable(message: String) -> Self {
        Self::new(Self::BUFFER_UNAVAILABLE, message)
    }

    pub fn unknown_function(name: &str) -> Self {
        Self::new(Self::UNKNOWN_FUNCTION, format!("unknown function: {name}"))
    }

    pub fn page_not_bound(page_id: &str) -> Self {
        Self::new(
            Self::PAGE_NOT_BOUND,
            format!("page {page_id} has no active assistant binding"),
        )
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Only store outages are worth redelivering; the queue retries those.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, Self::RESOLUTION_FAILED | Self::BUFFER_UNAVAILABLE)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RelayError>()
        .map(RelayError::is_retryable)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationFailure {
    FetchFailed,
    CreateFailed,
    ReplayFailed,
    PersistFailed,
    ResumeFailed,
    DepthExceeded,
}

impl MigrationFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationFailure::FetchFailed => "fetch-failed",
            MigrationFailure::CreateFailed => "create-failed",
            MigrationFailure::ReplayFailed => "replay-failed",
            MigrationFailure::PersistFailed => "persist-failed",
            MigrationFailure::ResumeFailed => "resume-failed",
            MigrationFailure::DepthExceeded => "depth-exceeded",
        }
    }
}

#[derive(Debug)]
pub struct MigrationError {
    pub failure: MigrationFailure,
    pub source: anyhow::Error,
}

impl MigrationError {
    pub fn new(failure: MigrationFailure, source: anyhow::Error) -> Self {
        Self { failure, source }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread migration {}: {}", self.failure.as_str(), self.source)
    }
}

impl std::error::Error for MigrationError {}
