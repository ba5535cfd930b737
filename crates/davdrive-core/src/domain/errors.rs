//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! mostly path and configuration validation failures.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Repository URL could not be parsed or has an unsupported scheme
    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),

    /// Repository path lies outside the configured document library
    #[error("Path not within repository root: {0}")]
    PathNotInRepository(String),

    /// Unknown server dialect name
    #[error("Unknown server dialect: {0}")]
    UnknownDialect(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
