//! Manifest, layer, config, index, and annotation types, with schema validation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::digest;
use crate::error::{Error, Result};

/// A small JSON record referencing a blob by media type, size, and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The blob's media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// The blob's byte length.
    pub size: u64,
    /// `<algo>:<hex>` digest of the blob.
    pub digest: String,
    /// Arbitrary annotations attached to this descriptor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Build a layer descriptor from an on-disk blob, inferring its media type from
    /// whether it was packaged as a directory (gzip) or single file (plain tar).
    pub fn for_layer(blob: &Path, is_dir: bool, media_type: Option<String>) -> Result<Self> {
        let media_type = media_type.unwrap_or_else(|| {
            if is_dir {
                defaults::BLOB_DIR_MEDIA_TYPE.to_string()
            } else {
                defaults::BLOB_MEDIA_TYPE.to_string()
            }
        });
        let size = std::fs::metadata(blob)?.len();
        let hash = digest::sha256_file(blob)?;
        let descriptor = Self {
            media_type,
            size,
            digest: format!("sha256:{hash}"),
            annotations: BTreeMap::new(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Build a config descriptor from `path`, or the well-known blank-config
    /// descriptor when `path` is `None`.
    pub fn for_config(path: Option<&Path>, media_type: Option<String>) -> Result<(Self, Option<std::path::PathBuf>)> {
        let media_type = media_type.unwrap_or_else(|| defaults::UNKNOWN_CONFIG_MEDIA_TYPE.to_string());
        match path.filter(|p| p.exists()) {
            Some(path) => {
                let size = std::fs::metadata(path)?.len();
                let hash = digest::sha256_file(path)?;
                let descriptor = Self {
                    media_type,
                    size,
                    digest: format!("sha256:{hash}"),
                    annotations: BTreeMap::new(),
                };
                descriptor.validate()?;
                Ok((descriptor, Some(path.to_path_buf())))
            }
            None => {
                let descriptor = Self {
                    media_type,
                    size: 0,
                    digest: defaults::BLANK_HASH.to_string(),
                    annotations: BTreeMap::new(),
                };
                Ok((descriptor, None))
            }
        }
    }

    /// Build a `subject` descriptor referencing `manifest` by the SHA-256 of its
    /// canonical JSON bytes.
    pub fn for_subject(manifest: &Manifest) -> Result<Self> {
        let bytes = serde_json::to_vec(manifest)?;
        Ok(Self {
            media_type: manifest.media_type.clone(),
            size: bytes.len() as u64,
            digest: format!("sha256:{}", digest::sha256_bytes(&bytes)),
            annotations: BTreeMap::new(),
        })
    }

    /// Reject a descriptor with an empty media type or digest.
    pub fn validate(&self) -> Result<()> {
        if self.media_type.is_empty() {
            return Err(Error::SchemaInvalid("descriptor mediaType is empty".into()));
        }
        if !self.digest.contains(':') {
            return Err(Error::SchemaInvalid(format!(
                "descriptor digest '{}' is missing an algorithm prefix",
                self.digest
            )));
        }
        Ok(())
    }
}

/// Platform metadata attached to an index's sub-manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// The OS, e.g. `"linux"`.
    pub os: String,
    /// The CPU architecture, e.g. `"amd64"`.
    pub architecture: String,
    /// Optional CPU variant, e.g. `"v7"` for 32-bit ARM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A descriptor inside an [`Index`], optionally carrying platform metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The sub-manifest's media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// The sub-manifest's byte length.
    pub size: u64,
    /// The sub-manifest's digest.
    pub digest: String,
    /// The platform this sub-manifest targets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Annotations, typically including [`defaults::OCI_REF_NAME_ANNOTATION`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The top-level JSON that names a config and an ordered list of layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Always `2`.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Always [`defaults::MANIFEST_MEDIA_TYPE`].
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// The manifest's config descriptor.
    pub config: Descriptor,
    /// The manifest's layer descriptors, in upload order.
    pub layers: Vec<Descriptor>,
    /// Manifest-level annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// An optional referrers-API subject descriptor. Emit-only: this crate never
    /// queries the referrers API itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

impl Manifest {
    /// An empty manifest: `schemaVersion=2`, an empty config placeholder, no layers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: defaults::OCI_SCHEMA_VERSION,
            media_type: defaults::MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: String::new(),
                size: 0,
                digest: String::new(),
                annotations: BTreeMap::new(),
            },
            layers: Vec::new(),
            annotations: BTreeMap::new(),
            subject: None,
        }
    }

    /// Reject a manifest with the wrong `schemaVersion` or `mediaType`.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != defaults::OCI_SCHEMA_VERSION {
            return Err(Error::SchemaInvalid(format!(
                "manifest schemaVersion must be {}, got {}",
                defaults::OCI_SCHEMA_VERSION,
                self.schema_version
            )));
        }
        if self.media_type != defaults::MANIFEST_MEDIA_TYPE {
            return Err(Error::SchemaInvalid(format!(
                "manifest mediaType must be '{}', got '{}'",
                defaults::MANIFEST_MEDIA_TYPE,
                self.media_type
            )));
        }
        for layer in &self.layers {
            layer.validate()?;
        }
        Ok(())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// A manifest-of-manifests, typically used for multi-platform artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Always `2`.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Always [`defaults::INDEX_MEDIA_TYPE`] when present.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The index's sub-manifest entries.
    pub manifests: Vec<IndexEntry>,
    /// Index-level annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Index {
    /// Reject an index with the wrong `schemaVersion` or, if present, the wrong
    /// `mediaType`.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != defaults::OCI_SCHEMA_VERSION {
            return Err(Error::SchemaInvalid(format!(
                "index schemaVersion must be {}, got {}",
                defaults::OCI_SCHEMA_VERSION,
                self.schema_version
            )));
        }
        if let Some(media_type) = &self.media_type {
            if media_type != defaults::INDEX_MEDIA_TYPE {
                return Err(Error::SchemaInvalid(format!(
                    "index mediaType must be '{}', got '{media_type}'",
                    defaults::INDEX_MEDIA_TYPE
                )));
            }
        }
        Ok(())
    }
}

/// A two-level annotation mapping loaded from an optional JSON file: the outer key
/// is a section name (a file path, `"$manifest"`, or `"$config"`); the inner map is
/// attached to the corresponding layer, manifest, or config.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    lookup: BTreeMap<String, BTreeMap<String, String>>,
}

impl Annotations {
    /// Section name for manifest-level annotations.
    pub const MANIFEST_SECTION: &'static str = "$manifest";
    /// Section name for config-level annotations.
    pub const CONFIG_SECTION: &'static str = "$config";

    /// Load annotations from `path`. A missing path is not an error — it simply
    /// yields an empty annotation set — unless the caller explicitly passed `Some`
    /// path that should exist; that distinction is the caller's to make.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let lookup = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)?;
                serde_json::from_str(&contents)?
            }
            _ => BTreeMap::new(),
        };
        Ok(Self { lookup })
    }

    /// Get the annotations for `section`, trying both the given name and its
    /// absolute-path form, and returning an empty map if neither is present.
    #[must_use]
    pub fn get(&self, section: &str) -> BTreeMap<String, String> {
        if let Some(found) = self.lookup.get(section) {
            return found.clone();
        }
        if let Ok(abs) = std::fs::canonicalize(section) {
            if let Some(found) = self.lookup.get(&abs.display().to_string()) {
                return found.clone();
            }
        }
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn new_manifest_has_schema_version_two_and_no_layers() {
        let m = Manifest::new();
        assert_eq!(m.schema_version, 2);
        assert!(m.layers.is_empty());
        assert_eq!(m.media_type, defaults::MANIFEST_MEDIA_TYPE);
    }

    #[test]
    fn manifest_with_wrong_schema_version_is_invalid() {
        let mut m = Manifest::new();
        m.schema_version = 1;
        assert!(matches!(m.validate(), Err(Error::SchemaInvalid(_))));
    }

    #[test]
    fn blank_config_descriptor_uses_well_known_digest() {
        let (descriptor, path) = Descriptor::for_config(None, None).unwrap();
        assert_eq!(descriptor.digest, defaults::BLANK_HASH);
        assert_eq!(descriptor.size, 0);
        assert!(path.is_none());
    }

    #[test]
    fn layer_descriptor_from_file_hashes_its_bytes() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        let descriptor = Descriptor::for_layer(f.path(), false, None).unwrap();
        assert_eq!(
            descriptor.digest,
            "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
        assert_eq!(descriptor.media_type, defaults::BLOB_MEDIA_TYPE);
    }

    #[test]
    fn directory_layer_uses_gzip_media_type() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        let descriptor = Descriptor::for_layer(f.path(), true, None).unwrap();
        assert_eq!(descriptor.media_type, defaults::BLOB_DIR_MEDIA_TYPE);
    }

    #[test]
    fn annotations_missing_file_is_not_an_error() {
        let annotations = Annotations::load(None).unwrap();
        assert!(annotations.get("anything").is_empty());
    }

    #[test]
    fn annotations_lookup_by_section_name() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, r#"{{"$manifest": {{"key": "value"}}}}"#).unwrap();
        let annotations = Annotations::load(Some(f.path())).unwrap();
        assert_eq!(
            annotations.get(Annotations::MANIFEST_SECTION).get("key"),
            Some(&"value".to_string())
        );
    }
}
