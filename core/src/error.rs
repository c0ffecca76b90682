//! Structured error types for the NPC planner
//!
//! Only configuration and backend failures are represented here. Bad model
//! output never becomes a `PlannerError`; it is resolved to a fallback
//! decision (see [`crate::npc::repair::RejectionReason`]).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for planner operations
#[derive(Error, Debug)]
pub enum PlannerError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Session manager asked to create zero sessions
    #[error("at least one conversation session is required")]
    NoSessions,

    /// Session index does not name an existing session
    #[error("session index {index} out of range ({count} sessions)")]
    SessionIndexOutOfRange { index: usize, count: usize },

    /// Operation requires a ready runtime
    #[error("runtime is not initialized")]
    NotReady,

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Config file could not be parsed
    #[error("failed to parse config {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    // =========================================================================
    // Backend / Bootstrap Errors
    // =========================================================================
    /// Mandatory inference backend was not found in any search directory
    #[error("inference backend '{library}' not found (searched: {})", display_paths(.searched))]
    BackendNotFound {
        library: String,
        searched: Vec<PathBuf>,
    },

    /// Model weights failed to load
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// Backend did not become healthy in time
    #[error("backend did not become ready after {duration:?}")]
    StartupTimeout { duration: Duration },

    /// Backend failed while generating
    #[error("backend error: {message}")]
    Backend { message: String },

    /// Engine refused to compile a grammar
    #[error("grammar rejected: {reason}")]
    Grammar { reason: String },

    /// Engine checkpoint could not be restored
    #[error("engine state could not be restored: {reason}")]
    StateRestore { reason: String },

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// Generation aborted through a cancellation signal
    #[error("generation cancelled")]
    Cancelled,

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(String),
}

/// Coarse classification so callers can branch (disable UI vs. retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Backend,
    Cancelled,
}

impl PlannerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSessions
            | Self::SessionIndexOutOfRange { .. }
            | Self::NotReady
            | Self::InvalidConfig { .. }
            | Self::ConfigParse { .. } => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::BackendNotFound { .. }
            | Self::ModelLoad { .. }
            | Self::StartupTimeout { .. }
            | Self::Backend { .. }
            | Self::Grammar { .. }
            | Self::StateRestore { .. }
            | Self::Io(_)
            | Self::Http(_)
            | Self::Json(_) => ErrorKind::Backend,
        }
    }

    /// Check if the failed operation may succeed when the caller tries again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StartupTimeout { .. } | Self::Backend { .. } | Self::Http(_) => true,
            Self::ModelLoad { .. } | Self::BackendNotFound { .. } => true,
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            Self::NoSessions
            | Self::SessionIndexOutOfRange { .. }
            | Self::NotReady
            | Self::InvalidConfig { .. }
            | Self::ConfigParse { .. }
            | Self::Grammar { .. }
            | Self::StateRestore { .. }
            | Self::Cancelled
            | Self::Json(_) => false,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "<none>".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::Error> for PlannerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<reqwest::Error> for PlannerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type alias using PlannerError
pub type Result<T> = std::result::Result<T, PlannerError>;
