use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid path component {component:?}: {reason}")]
    InvalidComponent { component: String, reason: String },
}
