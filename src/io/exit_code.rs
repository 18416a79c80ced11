//! Exit codes for CLI operations following Unix conventions.
//!
//! # Exit Code Semantics
//!
//! - `0`: Success - operation completed, results found
//! - `1`: General error - unspecified failure
//! - `2`: Blocking error - the engine cannot serve searches at all
//! - `3-125`: Specific recoverable errors
//! - `126-255`: Reserved by shell

use crate::error::{AdminError, ComputeError, SearchError};

/// Standard exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation succeeded (code 0)
    Success = 0,

    /// Unspecified error occurred (code 1)
    GeneralError = 1,

    /// Critical error that should halt automation (code 2)
    BlockingError = 2,

    /// Search ran but returned nothing (code 3)
    NotFound = 3,

    /// Malformed embeddings or query input (code 4)
    InputError = 4,

    /// File I/O error (code 5)
    IoError = 5,

    /// Configuration error (code 6)
    ConfigError = 6,

    /// Compute device failed or was unavailable when required (code 7)
    ComputeError = 7,

    /// Deadline elapsed before the search finished (code 8)
    Timeout = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl ExitCode {
    /// `Success` when a search returned hits, `NotFound` when empty.
    pub fn from_results<T>(results: &[T]) -> Self {
        if results.is_empty() {
            ExitCode::NotFound
        } else {
            ExitCode::Success
        }
    }

    /// Maps a search error to the exit code scripts should see.
    pub fn from_error(error: &SearchError) -> Self {
        match error {
            SearchError::DimensionMismatch { .. } | SearchError::Index(_) => ExitCode::InputError,
            SearchError::Compute(ComputeError::DimensionMismatch { .. }) => ExitCode::InputError,
            SearchError::Compute(ComputeError::Unavailable { .. } | ComputeError::Disabled) => {
                ExitCode::BlockingError
            }
            SearchError::Compute(_) => ExitCode::ComputeError,
            SearchError::DeadlineExceeded { .. } => ExitCode::Timeout,
            SearchError::Worker(_) => ExitCode::GeneralError,
        }
    }

    pub fn from_admin_error(error: &AdminError) -> Self {
        match error {
            AdminError::Clustering(_) => ExitCode::GeneralError,
            AdminError::AlreadyRunning => ExitCode::BlockingError,
        }
    }

    /// Check if this exit code indicates a blocking error.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self, ExitCode::BlockingError)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    /// Get a human-readable description of the exit code.
    pub fn description(&self) -> &str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::GeneralError => "General error",
            ExitCode::BlockingError => "Blocking error - automation should halt",
            ExitCode::NotFound => "No results",
            ExitCode::InputError => "Invalid input",
            ExitCode::IoError => "I/O error",
            ExitCode::ConfigError => "Configuration error",
            ExitCode::ComputeError => "Compute device error",
            ExitCode::Timeout => "Deadline exceeded",
        }
    }
}
