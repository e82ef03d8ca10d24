// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Orchestrator error types.

use thiserror::Error;

/// Status code for malformed requests.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Status code for unknown endpoints or nodes.
pub const STATUS_NOT_FOUND: u16 = 404;

/// Error returned by the mutating configuration API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({status})")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(STATUS_BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(STATUS_NOT_FOUND, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == STATUS_NOT_FOUND
    }
}

/// Schema loading and validation errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("I/O error reading schema: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Violations(Vec<String>),
}

/// Errors raised while loading or converting the published nodes file.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Malformed published nodes: {0}")]
    Malformed(String),
}

impl ReconcileError {
    /// Whether the error is a transient I/O failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Io(_))
    }

    /// Whether the error means the content itself is unusable.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ReconcileError::Json(_) | ReconcileError::Schema(_) | ReconcileError::Malformed(_)
        )
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let e = ApiError::not_found("Endpoint not found: opc.tcp://plc:4840");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "Endpoint not found: opc.tcp://plc:4840 (404)");
    }

    #[test]
    fn test_reconcile_error_classes() {
        let io = ReconcileError::Io(std::io::Error::new(std::io::ErrorKind::Other, "busy"));
        assert!(io.is_transient());
        assert!(!io.is_malformed());

        let bad = ReconcileError::Malformed("both NodeId and OpcNodes".into());
        assert!(bad.is_malformed());
        assert_eq!(ApiError::from(bad).status, STATUS_BAD_REQUEST);
    }
}
