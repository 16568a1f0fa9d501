//! Pluggable auth strategies that mutate outgoing request headers in response to
//! 401/403 challenges.
//!
//! The source this crate's behavior is grounded on exposes these as a class
//! hierarchy (`AuthBackend` base, `TokenAuth`/`EcrAuth` subclasses). Here they are
//! a closed set of variants over one capability, `authenticate_request`, since
//! there are exactly three kinds and no caller-supplied fourth.

use std::collections::HashMap;
use std::sync::Mutex;

use aws_sdk_ecr::types::AuthorizationData;
use aws_smithy_http_client::{Builder as SmithyHttpClientBuilder, tls};
use regex::Regex;
use reqwest::header::HeaderMap;

use crate::credentials::basic_auth;

/// Fields parsed from a `WWW-Authenticate: Bearer realm="…",service="…",scope="…"`
/// challenge header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The URL where tokens are issued.
    pub realm: Option<String>,
    /// The service name the token is scoped to.
    pub service: Option<String>,
    /// The access scope requested, e.g. `repository:foo:pull`.
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parse a raw `WWW-Authenticate` header value.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r#"([a-zA-Z]+)="(.*?)""#).expect("fixed valid regex")
        });

        let mut challenge = Self::default();
        for caps in re.captures_iter(raw) {
            let key = &caps[1];
            let value = caps[2].to_string();
            match key {
                "realm" => challenge.realm = Some(value),
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
        challenge
    }
}

/// Outcome of [`AuthBackend::authenticate_request`]: updated headers to retry with,
/// and whether the dispatcher should retry at all.
pub struct AuthOutcome {
    /// The headers to use on the retried request.
    pub headers: HeaderMap,
    /// Whether the dispatcher should retry the request with these headers.
    pub should_retry: bool,
}

/// One of the three supported authentication strategies.
pub enum AuthBackend {
    /// Holds a base64 `user:pass`; always retries once with a `Basic` header.
    Basic(BasicAuth),
    /// OAuth2-style bearer token exchange against a challenge's `realm`.
    Token(TokenAuth),
    /// AWS ECR token issuance, falling back to [`TokenAuth`] for non-ECR realms.
    Ecr(EcrAuth),
}

impl AuthBackend {
    /// A basic-auth backend with no credentials yet.
    #[must_use]
    pub fn basic() -> Self {
        Self::Basic(BasicAuth::default())
    }

    /// A basic-auth backend primed from `ORAS_USER`/`ORAS_PASS`, if both are set.
    #[must_use]
    pub fn basic_from_env() -> Self {
        let mut backend = BasicAuth::default();
        if let (Ok(user), Ok(pass)) = (std::env::var("ORAS_USER"), std::env::var("ORAS_PASS")) {
            backend.set_basic_auth(&user, &pass);
        }
        Self::Basic(backend)
    }

    /// A token-exchange backend with no cached token yet.
    #[must_use]
    pub fn token() -> Self {
        Self::Token(TokenAuth::default())
    }

    /// An ECR-aware token backend with no cached tokens yet.
    #[must_use]
    pub fn ecr() -> Self {
        Self::Ecr(EcrAuth::default())
    }

    /// Set basic-auth credentials, regardless of which variant this is — callers
    /// who already hold credentials can skip discovery entirely.
    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        match self {
            Self::Basic(b) => b.set_basic_auth(username, password),
            Self::Token(t) => t.basic_auth = Some(basic_auth(username, password)),
            Self::Ecr(e) => e.token.basic_auth = Some(basic_auth(username, password)),
        }
    }

    /// Set an already-known bearer token directly, skipping the challenge dance.
    pub fn set_token_auth(&mut self, token: &str) {
        match self {
            Self::Basic(_) => {}
            Self::Token(t) => t.token = Some(token.to_string()),
            Self::Ecr(e) => e.token.token = Some(token.to_string()),
        }
    }

    /// Drop cached tokens/credentials, as part of logout.
    pub fn logout(&mut self) {
        match self {
            Self::Basic(b) => b.basic_auth = None,
            Self::Token(t) => t.token = None,
            Self::Ecr(e) => {
                e.token.token = None;
                e.tokens.lock().expect("ecr token cache mutex poisoned").clear();
            }
        }
    }

    /// Given a 401/403 response's headers and the headers already in flight,
    /// produce the headers to retry with and whether to retry at all.
    pub async fn authenticate_request(
        &mut self,
        www_authenticate: Option<&str>,
        headers: HeaderMap,
        refresh: bool,
        http: &reqwest::Client,
    ) -> AuthOutcome {
        match self {
            Self::Basic(b) => b.authenticate_request(headers),
            Self::Token(t) => t.authenticate_request(www_authenticate, headers, refresh, http).await,
            Self::Ecr(e) => e.authenticate_request(www_authenticate, headers, refresh, http).await,
        }
    }
}

/// Holds a base64 `user:pass`. Always returns `(headers + Authorization: Basic …,
/// true)` — the retry flag here means "retry exactly once with these headers".
#[derive(Debug, Clone, Default)]
pub struct BasicAuth {
    basic_auth: Option<String>,
}

impl BasicAuth {
    /// Set (or replace) the basic-auth credentials.
    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        self.basic_auth = Some(basic_auth(username, password));
    }

    fn authenticate_request(&self, mut headers: HeaderMap) -> AuthOutcome {
        let Some(auth) = &self.basic_auth else {
            return AuthOutcome {
                headers,
                should_retry: false,
            };
        };
        if let Ok(value) = format!("Basic {auth}").parse() {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        AuthOutcome {
            headers,
            should_retry: true,
        }
    }
}

/// OAuth2 (Docker token)-style auth: requests an anonymous token first, falls
/// back to a basic-auth-authenticated token request, and caches the result as a
/// bearer token for subsequent requests.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    token: Option<String>,
    basic_auth: Option<String>,
}

impl TokenAuth {
    /// Set basic-auth credentials to use when exchanging for a token.
    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        self.basic_auth = Some(basic_auth(username, password));
    }

    async fn authenticate_request(
        &mut self,
        www_authenticate: Option<&str>,
        mut headers: HeaderMap,
        refresh: bool,
        http: &reqwest::Client,
    ) -> AuthOutcome {
        if refresh {
            self.token = None;
        }

        if let Some(token) = &self.token {
            set_bearer(&mut headers, token);
            return AuthOutcome {
                headers,
                should_retry: true,
            };
        }

        let Some(raw) = www_authenticate else {
            return AuthOutcome {
                headers,
                should_retry: false,
            };
        };
        let challenge = AuthChallenge::parse(raw);

        if self.basic_auth.is_none() {
            if let Some(token) = request_anonymous_token(&challenge, http).await {
                self.token = Some(token.clone());
                set_bearer(&mut headers, &token);
                return AuthOutcome {
                    headers,
                    should_retry: true,
                };
            }
        }

        if let Some(token) = request_basic_token(&challenge, self.basic_auth.as_deref(), http).await {
            self.token = Some(token.clone());
            set_bearer(&mut headers, &token);
            return AuthOutcome {
                headers,
                should_retry: true,
            };
        }

        tracing::error!(
            "this endpoint requires a token; set basic auth credentials and retry"
        );
        AuthOutcome {
            headers,
            should_retry: false,
        }
    }
}

/// AWS ECR token issuance. Matches the challenge's realm against ECR's host
/// pattern and, when it does, exchanges it for a basic-auth token via the ECR
/// `GetAuthorizationToken` API; otherwise defers to plain [`TokenAuth`] behavior.
#[derive(Debug, Default)]
pub struct EcrAuth {
    token: TokenAuth,
    tokens: Mutex<HashMap<String, String>>,
}

impl EcrAuth {
    /// The AWS ECR realm pattern: `https://<12-digit-account>.dkr.ecr.<region>.amazonaws.com/`.
    fn realm_pattern() -> &'static Regex {
        static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"^https://(\d{12})\.dkr\.ecr\.([^.]+)\.amazonaws\.com/")
                .expect("fixed valid regex")
        })
    }

    async fn authenticate_request(
        &mut self,
        www_authenticate: Option<&str>,
        mut headers: HeaderMap,
        refresh: bool,
        http: &reqwest::Client,
    ) -> AuthOutcome {
        let Some(raw) = www_authenticate else {
            return AuthOutcome {
                headers,
                should_retry: false,
            };
        };
        let challenge = AuthChallenge::parse(raw);

        let is_ecr = challenge.service.as_deref() == Some("ecr.amazonaws.com")
            && challenge.realm.is_some();
        if !is_ecr {
            return self.token.authenticate_request(Some(raw), headers, refresh, http).await;
        }

        let realm = challenge.realm.clone().unwrap_or_default();
        let cached = self.tokens.lock().expect("ecr token cache mutex poisoned").get(&realm).cloned();
        let token = match cached.filter(|_| !refresh) {
            Some(token) => token,
            None => {
                let Some(caps) = Self::realm_pattern().captures(&realm) else {
                    tracing::warn!(realm = %realm, "ECR realm did not match expected pattern");
                    return AuthOutcome {
                        headers,
                        should_retry: false,
                    };
                };
                let region = caps[2].to_string();
                let token = fetch_ecr_authorization_token(&region).await;
                let Some(token) = token else {
                    return AuthOutcome {
                        headers,
                        should_retry: false,
                    };
                };
                self.tokens
                    .lock()
                    .expect("ecr token cache mutex poisoned")
                    .insert(realm, token.clone());
                token
            }
        };

        if let Ok(value) = format!("Basic {token}").parse() {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        AuthOutcome {
            headers,
            should_retry: true,
        }
    }
}

/// Exchange a region for an ECR basic-auth token via `GetAuthorizationToken`.
///
/// The token AWS returns is already base64 `AWS:<password>` — the same shape
/// this crate's own [`basic_auth`] produces for Docker registries — so it is
/// used directly as the `Basic` header value, no re-encoding needed.
async fn fetch_ecr_authorization_token(region: &str) -> Option<String> {
    // Force the ring-backed rustls provider rather than the default aws-lc one.
    let http_client = SmithyHttpClientBuilder::new()
        .tls_provider(tls::Provider::Rustls(tls::rustls_provider::CryptoMode::Ring))
        .build_https();
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .http_client(http_client)
        .region(aws_sdk_ecr::config::Region::new(region.to_string()))
        .load()
        .await;
    let client = aws_sdk_ecr::Client::new(&config);

    let response = match client.get_authorization_token().send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(region = %region, error = %e, "ECR GetAuthorizationToken failed");
            return None;
        }
    };

    let token = extract_authorization_token(response.authorization_data());
    if token.is_none() {
        tracing::warn!(region = %region, "ECR GetAuthorizationToken returned no authorization data");
    }
    token
}

/// Pick the authorization token out of `GetAuthorizationToken`'s response.
/// AWS returns at most one entry now that per-registry-id requests are
/// deprecated, but the response shape is still a list.
fn extract_authorization_token(data: &[AuthorizationData]) -> Option<String> {
    data.first()
        .and_then(AuthorizationData::authorization_token)
        .map(str::to_string)
}

fn set_bearer(headers: &mut HeaderMap, token: &str) {
    if let Ok(value) = format!("Bearer {token}").parse() {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
}

async fn request_anonymous_token(challenge: &AuthChallenge, http: &reqwest::Client) -> Option<String> {
    let realm = challenge.realm.as_ref()?;
    let mut query = Vec::new();
    if let Some(service) = &challenge.service {
        query.push(("service", service.as_str()));
    }
    if let Some(scope) = &challenge.scope {
        query.push(("scope", scope.as_str()));
    }

    let response = http.get(realm).query(&query).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    extract_token(response).await
}

async fn request_basic_token(
    challenge: &AuthChallenge,
    basic_auth: Option<&str>,
    http: &reqwest::Client,
) -> Option<String> {
    let realm = challenge.realm.as_ref()?;
    let basic_auth = basic_auth?;
    let mut query = Vec::new();
    if let Some(service) = &challenge.service {
        query.push(("service", service.as_str()));
    }
    if let Some(scope) = &challenge.scope {
        query.push(("scope", scope.as_str()));
    }

    let response = http
        .get(realm)
        .header(reqwest::header::AUTHORIZATION, format!("Basic {basic_auth}"))
        .query(&query)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    extract_token(response).await
}

async fn extract_token(response: reqwest::Response) -> Option<String> {
    let body: serde_json::Value = response.json().await.ok()?;
    body.get("token")
        .or_else(|| body.get("access_token"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.io/token",service="registry.example.io",scope="repository:foo:pull""#,
        );
        assert_eq!(challenge.realm.as_deref(), Some("https://auth.example.io/token"));
        assert_eq!(challenge.service.as_deref(), Some("registry.example.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:foo:pull"));
    }

    #[test]
    fn parses_challenge_missing_scope() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.io/token",service="registry.example.io""#,
        );
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn basic_auth_without_credentials_does_not_retry() {
        let backend = BasicAuth::default();
        let outcome = backend.authenticate_request(HeaderMap::new());
        assert!(!outcome.should_retry);
    }

    #[test]
    fn basic_auth_with_credentials_sets_header_and_retries() {
        let mut backend = BasicAuth::default();
        backend.set_basic_auth("me", "secret");
        let outcome = backend.authenticate_request(HeaderMap::new());
        assert!(outcome.should_retry);
        assert_eq!(
            outcome.headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Basic bWU6c2VjcmV0"
        );
    }

    #[test]
    fn ecr_realm_pattern_matches_account_and_region() {
        let caps = EcrAuth::realm_pattern()
            .captures("https://123456789012.dkr.ecr.us-east-1.amazonaws.com/")
            .unwrap();
        assert_eq!(&caps[1], "123456789012");
        assert_eq!(&caps[2], "us-east-1");
    }

    #[test]
    fn extract_authorization_token_picks_first_entry() {
        let data = vec![
            AuthorizationData::builder()
                .authorization_token("QVdTOnBhc3N3b3Jk")
                .build(),
        ];
        assert_eq!(
            extract_authorization_token(&data),
            Some("QVdTOnBhc3N3b3Jk".to_string())
        );
    }

    #[test]
    fn extract_authorization_token_empty_response_returns_none() {
        assert_eq!(extract_authorization_token(&[]), None);
    }

    #[test]
    fn extract_authorization_token_missing_token_field_returns_none() {
        let data = vec![AuthorizationData::builder().build()];
        assert_eq!(extract_authorization_token(&data), None);
    }
}
