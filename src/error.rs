use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Machine-readable error class carried on the wire alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    CapacityExceeded,
    VcsUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::VcsUnavailable => "vcs_unavailable",
            Self::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum MusterError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Worker capacity exceeded: {active} active of {cap} allowed")]
    CapacityExceeded { active: usize, cap: usize },

    #[error("Queue full for {key}: {capacity} messages")]
    QueueFull { key: String, capacity: usize },

    #[error("VCS operation failed: {message}")]
    Vcs { message: String, path: PathBuf },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Message delivery failed: {0}")]
    Delivery(String),

    #[error("No stdin available for worker {0}")]
    NoStdin(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Internal(String),
}

impl MusterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::Config(_) => ErrorCode::BadRequest,
            Self::NotFound(_) | Self::NoStdin(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::CapacityExceeded { .. } | Self::QueueFull { .. } => ErrorCode::CapacityExceeded,
            Self::Vcs { .. } => ErrorCode::VcsUnavailable,
            Self::Spawn(_)
            | Self::Delivery(_)
            | Self::Persistence(_)
            | Self::Timeout(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn vcs(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Vcs {
            message: message.into(),
            path: path.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_wire_strings() {
        assert_eq!(
            MusterError::Validation("x".into()).code().as_str(),
            "bad_request"
        );
        assert_eq!(
            MusterError::NotFound("x".into()).code().as_str(),
            "not_found"
        );
        assert_eq!(
            MusterError::CapacityExceeded { active: 10, cap: 10 }
                .code()
                .as_str(),
            "capacity_exceeded"
        );
        assert_eq!(
            MusterError::vcs("boom", "/tmp/wt").code().as_str(),
            "vcs_unavailable"
        );
    }
}
