//! Well-known constants: media types, digests, and OCI Image Layout file names.

/// Default tag applied to a [`crate::reference::Reference`] when none is given.
pub const DEFAULT_TAG: &str = "latest";

/// Docker Hub's canonical index hostname, used when a reference carries no registry.
pub const INDEX_HOSTNAME: &str = "docker.io";

/// Media type for a directory packaged as a gzip-compressed tar layer.
pub const BLOB_DIR_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media type for a single file packaged as an uncompressed tar layer.
pub const BLOB_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Media type used for a manifest config blob when the caller supplies none.
pub const UNKNOWN_CONFIG_MEDIA_TYPE: &str = "application/vnd.unknown.config.v1+json";

/// Media type of an OCI image manifest.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an OCI image index.
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Legacy Docker manifest media type, accepted (not emitted) on pull.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Legacy Docker manifest-list media type, accepted (not emitted) on pull.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// All media types a manifest `GET` should advertise via `Accept`.
pub const MANIFEST_ACCEPTED_MEDIA_TYPES: &[&str] = &[
    MANIFEST_MEDIA_TYPE,
    INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// Annotation key for a layer's human-readable file name.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Annotation key on an OCI Image Layout `index.json` entry naming its tag.
pub const OCI_REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// `blobs` subdirectory name within an OCI Image Layout.
pub const OCI_BLOBS_DIR: &str = "blobs";

/// `oci-layout` file name within an OCI Image Layout.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";

/// `index.json` file name within an OCI Image Layout.
pub const OCI_IMAGE_INDEX_FILE: &str = "index.json";

/// The only `imageLayoutVersion` this crate accepts.
pub const OCI_LAYOUT_VERSION_PIN: &str = "1.0.0";

/// The only `schemaVersion` this crate accepts for manifests and indexes.
pub const OCI_SCHEMA_VERSION: u32 = 2;

/// Chunk size used by [`crate::digest::read_in_chunks`] when streaming a blob upload.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// `sha256` of the empty byte string — the digest of a zero-length blob.
pub const BLANK_HASH: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// `sha256` of `{}` — the digest of the default empty manifest config.
pub const BLANK_CONFIG_HASH: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";
