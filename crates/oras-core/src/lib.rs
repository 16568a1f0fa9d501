//! Core client library for pushing, pulling, and storing OCI artifacts.
//!
//! Covers reference parsing, the OCI data model, digest/archive utilities, a
//! Docker-style credential store, pluggable auth backends, an OCI Distribution
//! v2 registry client, and an OCI Image Layout engine.

#![warn(missing_docs)]

mod auth;
mod credentials;
mod defaults;
mod digest;
mod error;
mod layout;
mod model;
mod reference;
mod registry;

pub use auth::{AuthBackend, AuthChallenge};
pub use credentials::CredentialStore;
pub use digest::{extract_targz, make_targz, sanitize_path, sha256_bytes, sha256_file};
pub use error::{Error, Result};
pub use layout::Layout;
pub use model::{Annotations, Descriptor, Index, IndexEntry, Manifest, Platform};
pub use reference::Reference;
pub use registry::Registry;

pub use defaults::{
    ANNOTATION_TITLE, BLANK_CONFIG_HASH, BLANK_HASH, BLOB_DIR_MEDIA_TYPE, BLOB_MEDIA_TYPE,
    DEFAULT_CHUNK_SIZE, DEFAULT_TAG, INDEX_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
    UNKNOWN_CONFIG_MEDIA_TYPE,
};
