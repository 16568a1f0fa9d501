//! OCI Image Layout directories: `oci-layout`, `index.json`, and content-addressed
//! blob storage, plus pushing to and pulling from a registry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::digest;
use crate::error::{Error, Result};
use crate::model::{Descriptor, Index, IndexEntry, Manifest};
use crate::reference::Reference;
use crate::registry::Registry;

#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// An OCI Image Layout directory on disk.
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Wrap an existing directory as a layout, without validating it.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a fresh, empty layout at `root`. `root` must not exist or must be
    /// empty; callers building one from a registry pull should use this.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            let mut entries = tokio::fs::read_dir(&root).await?;
            if entries.next_entry().await?.is_some() {
                return Err(Error::SchemaInvalid(format!(
                    "layout directory '{}' is not empty",
                    root.display()
                )));
            }
        } else {
            tokio::fs::create_dir_all(&root).await?;
        }

        let layout = Self { root };
        layout.write_marker().await?;
        layout.write_index(&Index {
            schema_version: defaults::OCI_SCHEMA_VERSION,
            media_type: Some(defaults::INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }).await?;
        Ok(layout)
    }

    /// This layout's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algo, hex) = digest
            .split_once(':')
            .ok_or_else(|| Error::SchemaInvalid(format!("digest '{digest}' is missing an algorithm prefix")))?;
        Ok(self.root.join(defaults::OCI_BLOBS_DIR).join(algo).join(hex))
    }

    async fn write_marker(&self) -> Result<()> {
        let marker = LayoutMarker {
            image_layout_version: defaults::OCI_LAYOUT_VERSION_PIN.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&marker)?;
        tokio::fs::write(self.root.join(defaults::OCI_LAYOUT_FILE), bytes).await?;
        Ok(())
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        tokio::fs::write(self.root.join(defaults::OCI_IMAGE_INDEX_FILE), bytes).await?;
        Ok(())
    }

    async fn read_index(&self) -> Result<Index> {
        let bytes = tokio::fs::read(self.root.join(defaults::OCI_IMAGE_INDEX_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Check that `oci-layout` and `index.json` exist, parse, and validate.
    pub async fn validate(&self) -> Result<()> {
        let marker_path = self.root.join(defaults::OCI_LAYOUT_FILE);
        if !marker_path.exists() {
            return Err(Error::FileNotFound(marker_path.display().to_string()));
        }
        let bytes = tokio::fs::read(&marker_path).await?;
        let marker: LayoutMarker = serde_json::from_slice(&bytes)?;
        if marker.image_layout_version != defaults::OCI_LAYOUT_VERSION_PIN {
            return Err(Error::VersionMismatch {
                expected: defaults::OCI_LAYOUT_VERSION_PIN.to_string(),
                actual: marker.image_layout_version,
            });
        }

        let index_path = self.root.join(defaults::OCI_IMAGE_INDEX_FILE);
        if !index_path.exists() {
            return Err(Error::FileNotFound(index_path.display().to_string()));
        }
        self.read_index().await?.validate()?;
        Ok(())
    }

    /// Write `blob`'s bytes into `blobs/<algo>/<hex>`, deduplicating against an
    /// already-present blob with the same digest.
    pub async fn write_blob(&self, digest: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.blob_path(digest)?;
        if dest.exists() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, bytes).await?;
        Ok(())
    }

    /// Add a manifest (already pushed as a blob) to `index.json` under `tag`,
    /// replacing any existing entry with the same tag annotation.
    pub async fn tag_manifest(&self, tag: &str, descriptor: &Descriptor) -> Result<()> {
        let mut index = self.read_index().await?;
        index.manifests.retain(|entry| {
            entry.annotations.get(defaults::OCI_REF_NAME_ANNOTATION).map(String::as_str) != Some(tag)
        });

        let mut annotations = descriptor.annotations.clone();
        annotations.insert(defaults::OCI_REF_NAME_ANNOTATION.to_string(), tag.to_string());
        index.manifests.push(IndexEntry {
            media_type: descriptor.media_type.clone(),
            size: descriptor.size,
            digest: descriptor.digest.clone(),
            platform: None,
            annotations,
        });
        self.write_index(&index).await
    }

    /// Resolve `tag` to its manifest descriptor via `index.json`.
    pub async fn resolve_tag(&self, tag: &str) -> Result<IndexEntry> {
        let index = self.read_index().await?;
        index
            .manifests
            .into_iter()
            .find(|entry| entry.annotations.get(defaults::OCI_REF_NAME_ANNOTATION).map(String::as_str) == Some(tag))
            .ok_or_else(|| Error::NotFound(format!("tag '{tag}' not found in layout index")))
    }

    /// Read and parse the manifest (or index) blob addressed by `digest`.
    pub async fn read_manifest(&self, digest: &str) -> Result<Manifest> {
        let bytes = tokio::fs::read(self.blob_path(digest)?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_manifest_bytes(&self, digest: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.blob_path(digest)?).await?)
    }

    /// Collect every blob digest a tag's manifest graph depends on, in
    /// dependency order (layers before config before manifest, nested indexes
    /// expanded depth-first), deduplicated so a digest shared across entries is
    /// only uploaded once.
    pub async fn get_ordered_blobs(&self, tag: &str) -> Result<Vec<String>> {
        let entry = self.resolve_tag(tag).await?;
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        self.collect_blobs(&entry.digest, &entry.media_type, &mut seen, &mut ordered).await?;
        Ok(ordered)
    }

    fn collect_blobs<'a>(
        &'a self,
        digest: &'a str,
        media_type: &'a str,
        seen: &'a mut HashSet<String>,
        ordered: &'a mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            if media_type == defaults::INDEX_MEDIA_TYPE {
                let bytes = self.read_manifest_bytes(digest).await?;
                let index: Index = serde_json::from_slice(&bytes)?;
                for sub in &index.manifests {
                    self.collect_blobs(&sub.digest, &sub.media_type, seen, ordered).await?;
                }
            } else if media_type == defaults::MANIFEST_MEDIA_TYPE {
                let manifest = self.read_manifest(digest).await?;
                for layer in &manifest.layers {
                    if seen.insert(layer.digest.clone()) {
                        ordered.push(layer.digest.clone());
                    }
                }
                if seen.insert(manifest.config.digest.clone()) {
                    ordered.push(manifest.config.digest.clone());
                }
            } else {
                return Err(Error::UnsupportedMediaType(media_type.to_string()));
            }

            if seen.insert(digest.to_string()) {
                ordered.push(digest.to_string());
            }
            Ok(())
        })
    }

    /// Push `tag`'s manifest graph to `registry` under `reference`, uploading
    /// layers and configs before the manifests that reference them.
    pub async fn push_to_registry(
        &self,
        tag: &str,
        registry: &mut Registry,
        reference: &Reference,
    ) -> Result<()> {
        let entry = self.resolve_tag(tag).await?;
        self.push_blob_tree(&entry.digest, &entry.media_type, registry, reference).await
    }

    fn push_blob_tree<'a>(
        &'a self,
        digest: &'a str,
        media_type: &'a str,
        registry: &'a mut Registry,
        reference: &'a Reference,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            let bytes = self.read_manifest_bytes(digest).await?;

            if media_type == defaults::INDEX_MEDIA_TYPE {
                let index: Index = serde_json::from_slice(&bytes)?;
                for sub in &index.manifests {
                    self.push_blob_tree(&sub.digest, &sub.media_type, registry, reference).await?;
                }
            } else if media_type == defaults::MANIFEST_MEDIA_TYPE {
                let manifest: Manifest = serde_json::from_slice(&bytes)?;
                for layer in &manifest.layers {
                    self.upload_raw_blob(&layer.digest, registry, reference).await?;
                }
                self.upload_raw_blob(&manifest.config.digest, registry, reference).await?;
            } else {
                return Err(Error::UnsupportedMediaType(media_type.to_string()));
            }

            let descriptor = Descriptor {
                media_type: media_type.to_string(),
                size: bytes.len() as u64,
                digest: digest.to_string(),
                annotations: BTreeMap::new(),
            };
            registry.upload_manifest_bytes(reference, &descriptor, bytes).await
        })
    }

    async fn upload_raw_blob(&self, digest: &str, registry: &mut Registry, reference: &Reference) -> Result<()> {
        let path = self.blob_path(digest)?;
        let size = tokio::fs::metadata(&path).await?.len();
        let descriptor = Descriptor {
            media_type: defaults::BLOB_MEDIA_TYPE.to_string(),
            size,
            digest: digest.to_string(),
            annotations: BTreeMap::new(),
        };
        registry.upload_blob(reference, &descriptor, &path, None).await
    }

    /// Pull `reference`'s manifest graph from `registry` into this (freshly
    /// created) layout, recording it under `tag` in `index.json`.
    pub async fn pull_from_registry(&self, tag: &str, registry: &mut Registry, reference: &Reference) -> Result<()> {
        let manifest = registry.get_manifest(reference).await?;
        let bytes = serde_json::to_vec(&manifest)?;
        let digest = format!("sha256:{}", digest::sha256_bytes(&bytes));

        self.pull_blob_tree(&digest, &manifest, &bytes, registry, reference).await?;

        self.tag_manifest(
            tag,
            &Descriptor {
                media_type: defaults::MANIFEST_MEDIA_TYPE.to_string(),
                size: bytes.len() as u64,
                digest,
                annotations: BTreeMap::new(),
            },
        )
        .await
    }

    async fn pull_blob_tree(
        &self,
        digest: &str,
        manifest: &Manifest,
        manifest_bytes: &[u8],
        registry: &mut Registry,
        reference: &Reference,
    ) -> Result<()> {
        for layer in &manifest.layers {
            let dest = self.blob_path(&layer.digest)?;
            registry.download_blob(reference, &layer.digest, &dest).await?;
        }
        let config_dest = self.blob_path(&manifest.config.digest)?;
        registry.download_blob(reference, &manifest.config.digest, &config_dest).await?;

        self.write_blob(digest, manifest_bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Descriptor;

    #[tokio::test]
    async fn create_writes_marker_and_empty_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = Layout::create(dir.path().join("layout")).await.unwrap();
        layout.validate().await.unwrap();
    }

    #[tokio::test]
    async fn create_rejects_nonempty_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("stray.txt"), b"x").await.unwrap();
        let err = Layout::create(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn validate_rejects_wrong_layout_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = Layout::create(dir.path()).await.unwrap();
        tokio::fs::write(
            dir.path().join(defaults::OCI_LAYOUT_FILE),
            br#"{"imageLayoutVersion": "0.9.0"}"#,
        )
        .await
        .unwrap();
        let err = layout.validate().await.unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn tag_manifest_then_resolve_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = Layout::create(dir.path()).await.unwrap();
        let descriptor = Descriptor {
            media_type: defaults::MANIFEST_MEDIA_TYPE.to_string(),
            size: 100,
            digest: "sha256:deadbeef".to_string(),
            annotations: BTreeMap::new(),
        };
        layout.tag_manifest("latest", &descriptor).await.unwrap();
        let entry = layout.resolve_tag("latest").await.unwrap();
        assert_eq!(entry.digest, "sha256:deadbeef");
    }

    #[tokio::test]
    async fn retagging_replaces_previous_entry_for_same_tag() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = Layout::create(dir.path()).await.unwrap();
        let mut descriptor = Descriptor {
            media_type: defaults::MANIFEST_MEDIA_TYPE.to_string(),
            size: 100,
            digest: "sha256:aaaa".to_string(),
            annotations: BTreeMap::new(),
        };
        layout.tag_manifest("latest", &descriptor).await.unwrap();
        descriptor.digest = "sha256:bbbb".to_string();
        layout.tag_manifest("latest", &descriptor).await.unwrap();

        let index = layout.read_index().await.unwrap();
        let matching: Vec<_> = index
            .manifests
            .iter()
            .filter(|e| e.annotations.get(defaults::OCI_REF_NAME_ANNOTATION).map(String::as_str) == Some("latest"))
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].digest, "sha256:bbbb");
    }

    #[tokio::test]
    async fn get_ordered_blobs_dedupes_shared_layer_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = Layout::create(dir.path()).await.unwrap();

        let mut manifest = Manifest::new();
        manifest.config.media_type = defaults::UNKNOWN_CONFIG_MEDIA_TYPE.to_string();
        manifest.config.digest = defaults::BLANK_CONFIG_HASH.to_string();
        manifest.layers.push(Descriptor {
            media_type: defaults::BLOB_MEDIA_TYPE.to_string(),
            size: 4,
            digest: "sha256:shared".to_string(),
            annotations: BTreeMap::new(),
        });
        manifest.layers.push(Descriptor {
            media_type: defaults::BLOB_MEDIA_TYPE.to_string(),
            size: 4,
            digest: "sha256:shared".to_string(),
            annotations: BTreeMap::new(),
        });
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let digest = format!("sha256:{}", digest::sha256_bytes(&bytes));
        layout.write_blob(&digest, &bytes).await.unwrap();

        layout
            .tag_manifest(
                "latest",
                &Descriptor {
                    media_type: defaults::MANIFEST_MEDIA_TYPE.to_string(),
                    size: bytes.len() as u64,
                    digest,
                    annotations: BTreeMap::new(),
                },
            )
            .await
            .unwrap();

        let ordered = layout.get_ordered_blobs("latest").await.unwrap();
        assert_eq!(ordered.iter().filter(|d| *d == "sha256:shared").count(), 1);
    }
}
