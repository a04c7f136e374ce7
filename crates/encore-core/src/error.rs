//! Engine error taxonomy.
//!
//! Recoverable conditions (a failed screenshot, a slow page) are absorbed
//! where they occur; the variants here are what crosses component seams.
//! No variant ever carries a secret value.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The input capture subscription could not be established.
    #[error("input capture permission denied: {0}")]
    Permission(String),

    /// A screen grab failed. Recoverable per action.
    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// OS-level input delivery failed. Fatal to the current action.
    #[error("input injection failed: {0}")]
    Injection(String),

    /// Retries exhausted without a visual match at the recorded target.
    #[error("visual verification failed after {attempts} attempt(s) at ({x}, {y})")]
    VerificationFailed { attempts: u32, x: i32, y: i32 },

    /// The screen never settled. A warning at the call site, not fatal.
    #[error("screen did not stabilize within {timeout_ms}ms")]
    StabilityTimeout { timeout_ms: u64 },

    /// User-triggered stop. Not a failure.
    #[error("aborted")]
    Aborted,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Credential lookup failures, surfaced by the secret-store collaborator.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("credential '{0}' not found")]
    NotFound(String),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("action {index}: offset {offset_ms}ms precedes previous offset {prev_ms}ms")]
    OffsetRegression {
        index: usize,
        offset_ms: u64,
        prev_ms: u64,
    },

    #[error("action {index}: credential name is empty")]
    EmptyCredentialName { index: usize },

    #[error("action {index}: credential name looks like a secret value")]
    SecretShapedName { index: usize },

    #[error("action {index}: empty text input")]
    EmptyText { index: usize },
}
