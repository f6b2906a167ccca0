use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("authentication failed for {image}: {message}")]
    Unauthorized { image: String, message: String },
    #[error("{op} {image} failed: {message}")]
    Failed { op: &'static str, image: String, message: String },
    #[error("timed out after {waited:?} waiting for {image} (present={present})")]
    Timeout { image: String, present: bool, waited: Duration },
    #[error("spawning {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("no registry client configured for copy of {0}")]
    NoRegistry(String),
    #[error("no runtime client configured for {0}")]
    NoRuntime(String),
    #[error(transparent)]
    InvalidImage(#[from] keel_core::ImageRefError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("execution engine is closed")]
    Closed,
    #[error("worker task aborted: {0}")]
    Panicked(String),
}

impl ExecError {
    pub fn is_auth(&self) -> bool { matches!(self, ExecError::Unauthorized { .. }) }

    /// Errors that will fail the same way on every retry.
    pub fn is_permanent(&self) -> bool { matches!(self, ExecError::InvalidImage(_) | ExecError::NoRegistry(_) | ExecError::NoRuntime(_)) }
}

/// Map a failed command's stderr to an error, recognizing auth failures.
pub(crate) fn classify_failure(op: &'static str, image: &str, stderr: &str) -> ExecError {
    let lower = stderr.to_ascii_lowercase();
    let auth = ["unauthorized", "authentication required", "401", "403", "denied"].iter().any(|m| lower.contains(m));
    let message = stderr.trim().lines().last().unwrap_or("").to_string();
    if auth {
        ExecError::Unauthorized { image: image.to_string(), message }
    } else {
        ExecError::Failed { op, image: image.to_string(), message }
    }
}
