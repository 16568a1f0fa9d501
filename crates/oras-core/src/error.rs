//! Error types spanning reference parsing, the registry provider, and the
//! OCI Image Layout engine.

use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by this crate's operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A container reference string did not match the reference grammar.
    #[error("invalid reference '{0}': {1}")]
    InvalidReference(String, String),

    /// A local blob, annotation file, or layout component was missing.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A resolved path escaped the base directory it was expected to stay under.
    #[error("path traversal: '{candidate}' escapes base '{base}'")]
    PathTraversal {
        /// The base directory the candidate was checked against.
        base: String,
        /// The offending candidate path.
        candidate: String,
    },

    /// A manifest, layer, or index failed schema validation.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// The registry returned a non-2xx status outside the auth handshake.
    #[error("registry returned {status} for {url}: {message}")]
    ProtocolError {
        /// The request URL.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The OCI error message, if one was present in the response body.
        message: String,
    },

    /// The server still refused the request after the full auth retry dance.
    #[error("authentication failed for '{0}': {1}")]
    AuthenticationFailed(String, String),

    /// Layout traversal encountered a media type other than image manifest or index.
    #[error("unsupported media type '{0}'")]
    UnsupportedMediaType(String),

    /// An `oci-layout` file's `imageLayoutVersion` was not the pinned version.
    #[error("imageLayoutVersion mismatch: expected '{expected}', got '{actual}'")]
    VersionMismatch {
        /// The pinned version this crate accepts.
        expected: String,
        /// The version actually found on disk.
        actual: String,
    },

    /// A tag lookup, referenced blob, or registry-side digest could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Digest recorded in a descriptor did not match the bytes it addresses.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest recorded in the descriptor.
        expected: String,
        /// The digest computed from the downloaded/read bytes.
        actual: String,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying HTTP client error (connection, TLS, timeout).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Build an [`Error::InvalidReference`].
    #[must_use]
    pub fn invalid_reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference(reference.into(), message.into())
    }

    /// Build an [`Error::PathTraversal`].
    #[must_use]
    pub fn path_traversal(base: impl Into<String>, candidate: impl Into<String>) -> Self {
        Self::PathTraversal {
            base: base.into(),
            candidate: candidate.into(),
        }
    }

    /// Build an [`Error::ProtocolError`].
    #[must_use]
    pub fn protocol_error(url: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::ProtocolError {
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    /// Build an [`Error::DigestMismatch`].
    #[must_use]
    pub fn digest_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DigestMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for errors the outer retry decorator should retry: network-level
    /// failures and 5xx responses. Authentication failures and TLS errors are not
    /// retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProtocolError { status, .. } => *status >= 500,
            Self::Http(e) => !is_tls_error(e),
            _ => false,
        }
    }
}

fn is_tls_error(e: &reqwest::Error) -> bool {
    e.source()
        .is_some_and(|s| s.to_string().to_lowercase().contains("tls"))
}

use std::error::Error as _;
