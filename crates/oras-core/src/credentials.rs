//! Loading, merging, and querying on-disk Docker-style credential files, and
//! invoking credential-helper binaries.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use base64::Engine as _;
use serde::Deserialize;

use crate::error::Result;

/// One entry of a loaded Docker config's `auths` map.
#[derive(Debug, Clone, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: BTreeMap<String, String>,
}

/// Merged view of one or more on-disk credential files, queryable by hostname.
///
/// Owned per provider instance — never a process-wide singleton — so multiple
/// providers configured for different registries never interfere with each other.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    auths: BTreeMap<String, String>,
    creds_store: Option<String>,
    cred_helpers: BTreeMap<String, String>,
}

impl CredentialStore {
    /// Load and merge `configs` in order, then the default Docker config at
    /// `~/.docker/config.json`. Later files win on a hostname conflict. A config
    /// path that does not exist is skipped, not an error.
    pub fn load(configs: &[PathBuf]) -> Result<Self> {
        let mut store = Self::default();
        let mut all_paths = configs.to_vec();
        if let Some(default_config) = find_docker_config() {
            all_paths.push(default_config);
        }

        for path in all_paths {
            if !path.exists() {
                tracing::warn!(path = %path.display(), "credential config does not exist");
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let parsed: DockerConfig = serde_json::from_str(&contents)?;
            for (host, entry) in parsed.auths {
                if let Some(auth) = entry.auth {
                    store.auths.insert(host, auth);
                }
            }
            if parsed.creds_store.is_some() {
                store.creds_store = parsed.creds_store;
            }
            store.cred_helpers.extend(parsed.cred_helpers);
        }
        Ok(store)
    }

    /// Look up basic-auth bytes (base64 `user:pass`) for `hostname`, trying the
    /// `{hostname, localhost<->127.0.0.1}` equivalence class.
    ///
    /// Discovery order per candidate: (1) a direct `auths` entry, (2) a per-host
    /// `credHelpers` entry, (3) the global `credsStore`. Helper failures (missing
    /// binary, non-zero exit, malformed JSON) are logged and treated as "not
    /// found", never a hard error.
    #[must_use]
    pub fn lookup(&self, hostname: &str) -> Option<String> {
        for candidate in iter_localhosts(hostname) {
            if let Some(auth) = self.auths.get(&candidate) {
                return Some(auth.clone());
            }
            if let Some(helper) = self.cred_helpers.get(&candidate) {
                if let Some(auth) = run_credential_helper(helper, &candidate) {
                    return Some(auth);
                }
            }
            if let Some(helper) = &self.creds_store {
                if let Some(auth) = run_credential_helper(helper, &candidate) {
                    return Some(auth);
                }
            }
        }
        None
    }

    /// Remove `hostname`'s entry from the in-memory view (and its localhost
    /// equivalents), as part of logout.
    pub fn remove(&mut self, hostname: &str) -> bool {
        let mut removed = false;
        for candidate in iter_localhosts(hostname) {
            if self.auths.remove(&candidate).is_some() {
                removed = true;
            }
        }
        removed
    }
}

/// Given a hostname, yield it and its `localhost` <-> `127.0.0.1` equivalent.
fn iter_localhosts(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if name.contains("localhost") {
        names.push(name.replace("localhost", "127.0.0.1"));
    } else if name.contains("127.0.0.1") {
        names.push(name.replace("127.0.0.1", "localhost"));
    }
    names
}

/// The default Docker config path (`~/.docker/config.json`), if it exists.
fn find_docker_config() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".docker").join("config.json");
    path.exists().then_some(path)
}

#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn run_credential_helper(name: &str, hostname: &str) -> Option<String> {
    let binary = format!("docker-credential-{name}");
    let mut child = match Command::new(&binary)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(binary = %binary, error = %e, "credential helper not found in PATH");
            return None;
        }
    };

    if let Some(stdin) = child.stdin.as_mut() {
        if stdin.write_all(hostname.as_bytes()).is_err() {
            return None;
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(binary = %binary, error = %e, "credential helper failed to run");
            return None;
        }
    };

    if !output.status.success() {
        tracing::warn!(
            binary = %binary,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "credential helper exited non-zero"
        );
        return None;
    }

    match serde_json::from_slice::<HelperOutput>(&output.stdout) {
        Ok(helper_output) => Some(basic_auth(&helper_output.username, &helper_output.secret)),
        Err(e) => {
            tracing::warn!(binary = %binary, error = %e, "credential helper returned malformed JSON");
            None
        }
    }
}

/// Base64-encode `"username:password"`, the form stored in a credential file's
/// `auth` field and sent as a `Basic` authorization header.
#[must_use]
pub fn basic_auth(username: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}
