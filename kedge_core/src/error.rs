//! Unified error handling for kedge
//!
//! This module provides the error type shared by every loader operation,
//! ensuring consistent error handling across the crate. Callers that need to
//! catch any loader failure can match on [`KedgeError`] itself; callers that
//! care about a specific failure match on the variant.

use thiserror::Error;

/// Main error type for kedge operations
#[derive(Debug, Error)]
pub enum KedgeError {
    /// The OS refused to open a shared library, or allocation failed while
    /// opening it
    #[error("Could not load library: {0}")]
    LibraryLoad(String),

    /// The OS refused to close a shared library
    #[error("Could not unload library: {0}")]
    LibraryUnload(String),

    /// No factory for the requested `(base, class)` pair is visible to the
    /// loader that asked
    #[error("Could not create class instance: {0}")]
    CreateClass(String),

    /// A `MultiLoader` was asked to use a library path that was never loaded
    /// through it
    #[error("No loader bound to library: {0}")]
    NoClassLoaderExists(String),
}

// Helper constructors so call sites don't repeat `.into()` chains
impl KedgeError {
    /// Create a library load error with a custom message
    pub fn library_load<S: Into<String>>(msg: S) -> Self {
        KedgeError::LibraryLoad(msg.into())
    }

    /// Create a library unload error with a custom message
    pub fn library_unload<S: Into<String>>(msg: S) -> Self {
        KedgeError::LibraryUnload(msg.into())
    }

    /// Create a class creation error with a custom message
    pub fn create_class<S: Into<String>>(msg: S) -> Self {
        KedgeError::CreateClass(msg.into())
    }

    /// Create a missing-loader error with a custom message
    pub fn no_class_loader<S: Into<String>>(msg: S) -> Self {
        KedgeError::NoClassLoaderExists(msg.into())
    }
}

/// Convenience type alias for Results using KedgeError
pub type KedgeResult<T> = std::result::Result<T, KedgeError>;

/// Short alias — `Result<T>` is equivalent to `KedgeResult<T>`
pub type Result<T> = KedgeResult<T>;
