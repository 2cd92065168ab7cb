//! Registry errors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Duplicate backend: {0}")]
    DuplicateBackend(String),
}
