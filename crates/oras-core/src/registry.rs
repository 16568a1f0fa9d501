//! OCI Distribution v2 registry client: blob/manifest CRUD, tag listing, and the
//! push/pull orchestration built on top of them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};

use crate::auth::AuthBackend;
use crate::defaults;
use crate::digest;
use crate::error::{Error, Result};
use crate::model::{Descriptor, Manifest};
use crate::reference::Reference;

const MAX_RETRIES: u32 = 5;

/// An OCI Distribution v2 client bound to one registry host, with its own auth
/// state. Cheap to clone (the inner HTTP client is pooled, connections are shared).
pub struct Registry {
    http: Client,
    auth: AuthBackend,
    insecure: bool,
}

impl Registry {
    /// A registry client with basic-auth credentials primed from `ORAS_USER`/`ORAS_PASS`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: Client::new(),
            auth: AuthBackend::basic_from_env(),
            insecure: false,
        }
    }

    /// Use plain HTTP instead of HTTPS for this registry's endpoint.
    #[must_use]
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Replace this client's auth backend, e.g. with [`AuthBackend::ecr()`].
    #[must_use]
    pub fn with_auth(mut self, auth: AuthBackend) -> Self {
        self.auth = auth;
        self
    }

    /// Prime basic-auth credentials directly, bypassing credential-store discovery.
    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        self.auth.set_basic_auth(username, password);
    }

    /// Install an already-obtained bearer token, bypassing the challenge handshake.
    pub fn set_token_auth(&mut self, token: &str) {
        self.auth.set_token_auth(token);
    }

    /// Drop cached credentials/tokens.
    pub fn logout(&mut self) {
        self.auth.logout();
    }

    fn scheme(&self) -> &'static str {
        if self.insecure { "http" } else { "https" }
    }

    /// Dispatch one request, retrying once on a 401/403 after running the auth
    /// challenge, then wrapped in an outer retry loop for transient failures.
    async fn do_request(
        &mut self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let result = self.do_request_once(method.clone(), url, headers.clone(), body.clone()).await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if attempt + 1 < MAX_RETRIES && e.is_retryable() => {
                    attempt += 1;
                    let backoff = Duration::from_secs(2 + 3u64.pow(attempt));
                    tracing::warn!(attempt, url, error = %e, "retrying after transient failure");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request attempt, including the inline 401/403 auth-retry (not the outer
    /// transient-failure retry loop).
    async fn do_request_once(
        &mut self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let full_url = format!("{}://{url}", self.scheme());
        let response = self.send(method.clone(), &full_url, headers.clone(), body.clone()).await?;

        if response.status() != StatusCode::UNAUTHORIZED && response.status() != StatusCode::FORBIDDEN {
            return ensure_success(response).await;
        }

        let www_authenticate = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let outcome = self
            .auth
            .authenticate_request(www_authenticate.as_deref(), headers, false, &self.http)
            .await;
        if !outcome.should_retry {
            return Err(Error::AuthenticationFailed(
                full_url,
                "no credentials available to satisfy the registry's challenge".into(),
            ));
        }

        let response = self.send(method, &full_url, outcome.headers, body).await?;
        ensure_success(response).await
    }

    async fn send(
        &self,
        method: Method,
        full_url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.request(method, full_url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        Ok(request.send().await?)
    }

    /// Upload `blob` under `reference`'s repository, choosing monolithic or chunked
    /// upload based on `chunk_size`. Skips the upload if the registry already has
    /// the blob (`HEAD` returns 200).
    pub async fn upload_blob(
        &mut self,
        reference: &Reference,
        descriptor: &Descriptor,
        blob: &Path,
        chunk_size: Option<usize>,
    ) -> Result<()> {
        if self.blob_exists(reference, &descriptor.digest).await? {
            tracing::debug!(digest = %descriptor.digest, "blob already present, skipping upload");
            return Ok(());
        }

        match chunk_size {
            Some(chunk_size) if descriptor.size > chunk_size as u64 => {
                self.chunked_upload(reference, descriptor, blob, chunk_size).await
            }
            _ => self.monolithic_upload(reference, descriptor, blob).await,
        }
    }

    async fn blob_exists(&mut self, reference: &Reference, digest: &str) -> Result<bool> {
        let url = reference.blob_url(digest);
        match self.do_request(Method::HEAD, &url, HeaderMap::new(), None).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start_upload_session(&mut self, reference: &Reference) -> Result<String> {
        let url = reference.upload_blob_url();
        let response = self.do_request(Method::POST, &url, HeaderMap::new(), None).await?;
        location_header(&response)
    }

    async fn monolithic_upload(
        &mut self,
        reference: &Reference,
        descriptor: &Descriptor,
        blob: &Path,
    ) -> Result<()> {
        let session_url = self.start_upload_session(reference).await?;
        let bytes = tokio::fs::read(blob).await?;

        let separator = if session_url.contains('?') { '&' } else { '?' };
        let url = format!("{session_url}{separator}digest={}", descriptor.digest);

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        self.commit_upload(&strip_scheme(&url), descriptor, headers, Some(bytes)).await
    }

    async fn chunked_upload(
        &mut self,
        reference: &Reference,
        descriptor: &Descriptor,
        blob: &Path,
        chunk_size: usize,
    ) -> Result<()> {
        let mut session_url = self.start_upload_session(reference).await?;
        let file = std::fs::File::open(blob)?;

        let mut offset: u64 = 0;
        for chunk in digest::read_in_chunks(file, chunk_size) {
            let chunk = chunk?;
            let len = chunk.len() as u64;

            let mut headers = HeaderMap::new();
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            headers.insert(
                reqwest::header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("{offset}-{}", offset + len - 1))
                    .map_err(|_| Error::SchemaInvalid("invalid content-range".into()))?,
            );

            let response = self
                .do_request(Method::PATCH, &strip_scheme(&session_url), headers, Some(chunk))
                .await?;
            // Registries may rotate the upload-session URL on every chunk response.
            session_url = location_header(&response).unwrap_or(session_url);
            offset += len;
        }

        let separator = if session_url.contains('?') { '&' } else { '?' };
        let url = format!("{session_url}{separator}digest={}", descriptor.digest);
        self.commit_upload(&strip_scheme(&url), descriptor, HeaderMap::new(), None).await
    }

    /// Issue the commit `PUT` that closes an upload session. Some registries
    /// reject the well-known empty blob outright rather than storing it; since
    /// that blob is reconstructable without a download, the rejection is
    /// treated as a successful upload instead of propagated.
    async fn commit_upload(
        &mut self,
        url: &str,
        descriptor: &Descriptor,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        match self.do_request(Method::PUT, url, headers, body).await {
            Ok(_) => Ok(()),
            Err(e) if descriptor.digest == defaults::BLANK_HASH => {
                tracing::debug!(
                    error = %e,
                    "registry rejected empty blob commit, treating as success"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Download the blob addressed by `digest` to `dest`, verifying its hash.
    pub async fn download_blob(&mut self, reference: &Reference, digest: &str, dest: &Path) -> Result<()> {
        let url = reference.blob_url(digest);
        let response = self.do_request(Method::GET, &url, HeaderMap::new(), None).await?;
        let bytes = response.bytes().await?;

        let actual = format!("sha256:{}", digest::sha256_bytes(&bytes));
        if digest.starts_with("sha256:") && actual != digest {
            return Err(Error::digest_mismatch(digest, actual));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    /// Upload `manifest` to `reference`'s tag or digest address.
    pub async fn upload_manifest(&mut self, reference: &Reference, manifest: &Manifest) -> Result<Descriptor> {
        manifest.validate()?;
        let bytes = serde_json::to_vec(manifest)?;
        let digest = format!("sha256:{}", digest::sha256_bytes(&bytes));

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_str(&manifest.media_type)
                .map_err(|_| Error::SchemaInvalid("invalid media type".into()))?,
        );

        self.do_request(Method::PUT, &reference.manifest_url(), headers, Some(bytes.clone()))
            .await?;

        Ok(Descriptor {
            media_type: manifest.media_type.clone(),
            size: bytes.len() as u64,
            digest,
            annotations: std::collections::BTreeMap::new(),
        })
    }

    /// Upload an already-serialized manifest or index blob, addressed by the tag
    /// or digest in `reference`. Used by the OCI Image Layout engine, which reads
    /// manifest/index blobs from disk rather than building [`Manifest`] values.
    pub async fn upload_manifest_bytes(
        &mut self,
        reference: &Reference,
        descriptor: &Descriptor,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_str(&descriptor.media_type)
                .map_err(|_| Error::SchemaInvalid("invalid media type".into()))?,
        );
        let url = reference.manifest_url_for(&descriptor.digest);
        self.do_request(Method::PUT, &url, headers, Some(bytes)).await?;
        Ok(())
    }

    /// Fetch and parse the manifest at `reference`'s tag or digest address.
    pub async fn get_manifest(&mut self, reference: &Reference) -> Result<Manifest> {
        let mut headers = HeaderMap::new();
        let accept = defaults::MANIFEST_ACCEPTED_MEDIA_TYPES.join(", ");
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_str(&accept).map_err(|_| Error::SchemaInvalid("invalid accept header".into()))?,
        );

        let response = self.do_request(Method::GET, &reference.manifest_url(), headers, None).await?;
        let bytes = response.bytes().await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok(manifest)
    }

    /// List every tag for `reference`'s repository, following RFC 5988 `Link`
    /// pagination until exhausted.
    pub async fn get_tags(&mut self, reference: &Reference, page_size: Option<u32>) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = reference.tags_url(page_size);

        loop {
            let response = self.do_request(Method::GET, &url, HeaderMap::new(), None).await?;
            let next = next_page_link(&response, &reference.registry);
            let body: serde_json::Value = response.json().await?;

            if let Some(page) = body.get("tags").and_then(|t| t.as_array()) {
                tags.extend(page.iter().filter_map(|v| v.as_str()).map(str::to_string));
            }

            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }
        Ok(tags)
    }

    /// Delete `tag_or_digest` via `HEAD` (to resolve its digest) then `DELETE`.
    pub async fn delete_tag(&mut self, reference: &Reference, tag_or_digest: &str) -> Result<()> {
        let url = reference.manifest_url_for(tag_or_digest);

        let mut headers = HeaderMap::new();
        let accept = defaults::MANIFEST_ACCEPTED_MEDIA_TYPES.join(", ");
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_str(&accept).map_err(|_| Error::SchemaInvalid("invalid accept header".into()))?,
        );
        let response = self.do_request(Method::HEAD, &url, headers, None).await?;

        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| tag_or_digest.to_string());

        let delete_url = reference.manifest_url_for(&digest);
        self.do_request(Method::DELETE, &delete_url, HeaderMap::new(), None).await?;
        Ok(())
    }

    /// Push a list of files (or directories, packaged as a directory layer) as an
    /// artifact's layers, along with an optional manifest config, then upload the
    /// manifest itself.
    ///
    /// Each path is rejected with [`Error::PathTraversal`] if it escapes the
    /// current working directory, unless `disable_path_validation` is set.
    /// Directory inputs are archived with [`digest::make_targz`] and the
    /// temporary archive is removed once its upload completes (success or
    /// failure alike).
    pub async fn push_files(
        &mut self,
        reference: &Reference,
        files: &[PathBuf],
        config: Option<crate::digest::PathAndMediaType>,
        annotations: Option<&crate::model::Annotations>,
        chunk_size: Option<usize>,
        disable_path_validation: bool,
    ) -> Result<Descriptor> {
        let cwd = std::env::current_dir()?;
        let mut manifest = Manifest::new();

        for file in files {
            // Relative paths are checked against escaping the working directory;
            // an absolute path is the caller's explicit choice and is not subject
            // to this check.
            if !disable_path_validation && file.is_relative() {
                digest::sanitize_path(&cwd, &cwd.join(file))?;
            }

            let is_dir = file.is_dir();
            let (blob_path, is_temp) = if is_dir {
                (digest::make_targz(file)?, true)
            } else {
                (file.clone(), false)
            };

            let upload_result = async {
                let mut descriptor = Descriptor::for_layer(&blob_path, is_dir, None)?;
                let title = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                descriptor.annotations.insert(defaults::ANNOTATION_TITLE.to_string(), title);
                if let Some(annotations) = annotations {
                    descriptor.annotations.extend(annotations.get(&file.display().to_string()));
                }
                self.upload_blob(reference, &descriptor, &blob_path, chunk_size).await?;
                Ok::<_, Error>(descriptor)
            }
            .await;

            if is_temp {
                let _ = std::fs::remove_file(&blob_path);
            }
            manifest.layers.push(upload_result?);
        }

        let (config_descriptor, config_path) = match &config {
            Some(c) => Descriptor::for_config(Some(Path::new(&c.path)), c.media_type.clone())?,
            None => Descriptor::for_config(None, None)?,
        };
        if let Some(path) = &config_path {
            self.upload_blob(reference, &config_descriptor, path, chunk_size).await?;
        }
        manifest.config = config_descriptor;

        if let Some(annotations) = annotations {
            manifest.annotations.extend(annotations.get(crate::model::Annotations::MANIFEST_SECTION));
            manifest
                .config
                .annotations
                .extend(annotations.get(crate::model::Annotations::CONFIG_SECTION));
        }

        self.upload_manifest(reference, &manifest).await
    }

    /// Fetch a manifest and write each of its layers into `outdir`, naming each
    /// file from its `org.opencontainers.image.title` annotation (falling back to
    /// its digest). Directory-layer blobs are downloaded to a temp file and
    /// extracted; a well-known blank-blob digest is written as an empty file
    /// without a network round trip. Existing files are left alone unless
    /// `overwrite` is set.
    pub async fn pull_files(&mut self, reference: &Reference, outdir: &Path, overwrite: bool) -> Result<Manifest> {
        let manifest = self.get_manifest(reference).await?;
        tokio::fs::create_dir_all(outdir).await?;

        for layer in &manifest.layers {
            let name = layer
                .annotations
                .get(defaults::ANNOTATION_TITLE)
                .cloned()
                .unwrap_or_else(|| layer.digest.replace(':', "_"));
            let dest = digest::sanitize_path(outdir, &outdir.join(&name))?;

            if dest.exists() && !overwrite {
                tracing::debug!(path = %dest.display(), "skipping existing file");
                continue;
            }

            if layer.digest == defaults::BLANK_HASH {
                tokio::fs::write(&dest, b"").await?;
                continue;
            }

            if layer.media_type == defaults::BLOB_DIR_MEDIA_TYPE {
                let tmp = tempfile::Builder::new().suffix(".tar.gz").tempfile()?;
                let tmp_path = tmp.into_temp_path();
                self.download_blob(reference, &layer.digest, &tmp_path).await?;
                digest::extract_targz(&tmp_path, &dest)?;
            } else {
                self.download_blob(reference, &layer.digest, &dest).await?;
            }
        }

        Ok(manifest)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(url));
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::protocol_error(url, status.as_u16(), body))
}

fn location_header(response: &reqwest::Response) -> Result<String> {
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::ProtocolError {
            url: response.url().to_string(),
            status: response.status().as_u16(),
            message: "response carried no Location header".into(),
        })
}

fn strip_scheme(url: &str) -> String {
    url.split_once("://").map_or_else(|| url.to_string(), |(_, rest)| rest.to_string())
}

fn next_page_link(response: &reqwest::Response, registry_host: &str) -> Option<String> {
    let link = response.headers().get(reqwest::header::LINK)?.to_str().ok()?;
    let url = link.split(';').next()?.trim().trim_start_matches('<').trim_end_matches('>');
    if url.contains("://") {
        Some(strip_scheme(url))
    } else if url.starts_with('/') {
        Some(format!("{registry_host}{url}"))
    } else {
        Some(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_scheme_removes_protocol_prefix() {
        assert_eq!(strip_scheme("https://ghcr.io/v2/a"), "ghcr.io/v2/a");
        assert_eq!(strip_scheme("ghcr.io/v2/a"), "ghcr.io/v2/a");
    }
}
