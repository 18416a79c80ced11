//! Input/Output handling for the CLI.
//!
//! This module provides:
//! - JSON Lines embedding input
//! - Unified JSON responses
//! - Exit codes scripts can branch on

pub mod exit_code;
pub mod format;
pub mod input;

pub use exit_code::ExitCode;
pub use format::{ErrorDetails, JsonResponse, OutputFormat, ResponseMeta};
pub use input::{EmbeddingRecord, InputError, load_records, read_records};
