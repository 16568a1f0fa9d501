//! Container reference parsing: `registry/namespace/repository:tag@digest`.

use std::fmt;
use std::str::FromStr;

use crate::defaults;
use crate::error::{Error, Result};

/// A parsed OCI container reference, with lazily-derived endpoint URLs.
///
/// Digest takes precedence over tag for manifest addressing, per the
/// invariant that a more specific address always wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// `host[:port]`. Defaults to [`defaults::INDEX_HOSTNAME`] when the input carries none.
    pub registry: String,
    /// Zero or more `/`-separated path segments preceding the repository name.
    pub namespace: String,
    /// The repository name. Always non-empty.
    pub repository: String,
    /// The tag. Defaults to `"latest"` when the input carries none.
    pub tag: String,
    /// The digest, if the input carried one (`@sha256:...`).
    pub digest: Option<String>,
}

fn reference_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?x)
            (?:(?P<registry>[^/@]+[.:][^/@]*)/)?
            (?P<namespace>(?:[^:@/]+/)+)?
            (?P<repository>[^:@/]+)
            (?::(?P<tag>[^:@]+))?
            (?:@(?P<digest>.+))?
            $",
        )
        .expect("reference grammar is a fixed, valid regex")
    })
}

impl Reference {
    /// Parse `s` as a container reference, using `default_registry` when `s` carries
    /// none of its own.
    pub fn parse(s: &str, default_registry: Option<&str>) -> Result<Self> {
        let caps = reference_regex()
            .captures(s)
            .ok_or_else(|| Error::invalid_reference(s, "does not match reference grammar"))?;

        let repository = caps
            .name("repository")
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::invalid_reference(s, "repository is required"))?;

        let namespace = caps
            .name("namespace")
            .map_or("", |m| m.as_str())
            .trim_matches('/')
            .to_string();

        let registry = caps
            .name("registry")
            .map(|m| m.as_str().to_string())
            .or_else(|| default_registry.map(str::to_string))
            .unwrap_or_else(|| defaults::INDEX_HOSTNAME.to_string());

        let tag = caps
            .name("tag")
            .map_or(defaults::DEFAULT_TAG, |m| m.as_str())
            .to_string();

        let digest = caps.name("digest").map(|m| m.as_str().to_string());

        Ok(Self {
            registry,
            namespace,
            repository,
            tag,
            digest,
        })
    }

    /// `{namespace}/{repository}`, the portion of the API path naming the repo.
    #[must_use]
    pub fn api_prefix(&self) -> String {
        if self.namespace.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.namespace, self.repository)
        }
    }

    /// The `tag_or_digest` path segment used to address a manifest: the digest if
    /// present, else the tag.
    #[must_use]
    pub fn tag_or_digest(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.tag)
    }

    /// `registry/v2/{api_prefix}/blobs/{digest}`, without scheme.
    #[must_use]
    pub fn blob_url(&self, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{digest}",
            self.registry,
            self.api_prefix()
        )
    }

    /// `registry/v2/{api_prefix}/manifests/{tag_or_digest}`, without scheme.
    #[must_use]
    pub fn manifest_url(&self) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry,
            self.api_prefix(),
            self.tag_or_digest()
        )
    }

    /// `registry/v2/{api_prefix}/manifests/{ref}`, without scheme, for an explicit tag
    /// or digest rather than this reference's own.
    #[must_use]
    pub fn manifest_url_for(&self, tag_or_digest: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{tag_or_digest}",
            self.registry,
            self.api_prefix()
        )
    }

    /// `registry/v2/{api_prefix}/blobs/uploads/`, without scheme.
    #[must_use]
    pub fn upload_blob_url(&self) -> String {
        format!("{}/v2/{}/blobs/uploads/", self.registry, self.api_prefix())
    }

    /// `registry/v2/{api_prefix}/tags/list[?n=N]`, without scheme.
    #[must_use]
    pub fn tags_url(&self, limit: Option<u32>) -> String {
        let base = format!("{}/v2/{}/tags/list", self.registry, self.api_prefix());
        match limit {
            Some(n) => format!("{base}?n={n}"),
            None => base,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.api_prefix())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")
        } else {
            write!(f, ":{}", self.tag)
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, None)
    }
}
