//! Remote image deletion after a successful load.
//!
//! Registries implementing the distribution API get a manifest DELETE, with a
//! single retry after a bearer-token exchange. Docker Hub does not support
//! that API, so its tag is deleted through the Hub web API instead.

use async_trait::async_trait;
use bundle_core::error::{BundleError, Result};
use reqwest::header::{AUTHORIZATION, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::credentials::Credential;
use super::image::ImageRemover;
use super::reference::ImageReference;
use super::registry::ClientOptions;

/// Docker Hub web API base URL.
const DOCKER_HUB_API_URL: &str = "https://hub.docker.com/v2";

/// Accept header for manifest deletion.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
    }
}

#[derive(Serialize)]
struct HubLogin<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct HubLoginResponse {
    token: String,
}

/// Deletes images from their registry.
pub struct RegistryPruner {
    http: reqwest::Client,
    credential: Credential,
    user_agent: &'static str,
    cancel: CancellationToken,
    insecure: bool,
}

impl RegistryPruner {
    pub fn new(options: &ClientOptions) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential: options.credential.clone(),
            user_agent: options.user_agent,
            cancel: options.cancel.clone(),
            insecure: options.insecure,
        }
    }

    async fn send(&self, reference: &ImageReference, request: RequestBuilder) -> Result<Response> {
        let request = request.header(USER_AGENT, self.user_agent).send();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BundleError::Cancelled),
            response = request => response.map_err(|e| prune_error(reference, format!("request failed: {}", e))),
        }
    }

    fn with_basic_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Credential::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credential::Anonymous => request,
        }
    }

    /// `DELETE /v2/<repo>/manifests/<digest>`, retried once with a bearer
    /// token when the registry challenges for one.
    async fn delete_manifest(&self, reference: &ImageReference, digest: &str) -> Result<()> {
        let scheme = if self.insecure { "http" } else { "https" };
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, reference.registry, reference.repository, digest
        );

        tracing::debug!(url = %url, "Deleting manifest");

        let delete = || self.http.delete(&url).header("Accept", MANIFEST_ACCEPT);
        let response = self
            .send(reference, self.with_basic_auth(delete()))
            .await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge)
                .ok_or_else(|| {
                    prune_error(reference, "registry rejected the delete credentials".to_string())
                })?;
            let token = self.fetch_token(reference, &challenge).await?;
            self.send(reference, delete().bearer_auth(token)).await?
        } else {
            response
        };

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            status => Err(prune_error(
                reference,
                format!("registry returned {} for manifest delete", status),
            )),
        }
    }

    async fn fetch_token(
        &self,
        reference: &ImageReference,
        challenge: &BearerChallenge,
    ) -> Result<String> {
        let scope = format!("repository:{}:delete", reference.repository);
        let mut query: Vec<(&str, &str)> = vec![("scope", scope.as_str())];
        if let Some(ref service) = challenge.service {
            query.push(("service", service.as_str()));
        }

        let request = self.with_basic_auth(self.http.get(&challenge.realm).query(&query));
        let response = self.send(reference, request).await?;
        if !response.status().is_success() {
            return Err(prune_error(
                reference,
                format!("token endpoint returned {}", response.status()),
            ));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| prune_error(reference, format!("invalid token response: {}", e)))?
            .into_token()
            .ok_or_else(|| prune_error(reference, "token response has no token".to_string()))
    }

    /// Delete a tag through the Docker Hub web API.
    async fn delete_hub_tag(&self, reference: &ImageReference) -> Result<()> {
        let tag = reference.tag().ok_or_else(|| {
            prune_error(
                reference,
                "Docker Hub images can only be pruned by tag".to_string(),
            )
        })?;
        let (username, password) = match &self.credential {
            Credential::Basic { username, password } => (username, password),
            Credential::Anonymous => {
                return Err(prune_error(
                    reference,
                    "Docker Hub deletion requires username and password credentials".to_string(),
                ))
            }
        };

        let login = self
            .http
            .post(format!("{}/users/login", DOCKER_HUB_API_URL))
            .json(&HubLogin { username, password });
        let response = self.send(reference, login).await?;
        if !response.status().is_success() {
            return Err(prune_error(
                reference,
                format!("Docker Hub login returned {}", response.status()),
            ));
        }
        let token = response
            .json::<HubLoginResponse>()
            .await
            .map_err(|e| prune_error(reference, format!("invalid Docker Hub login response: {}", e)))?
            .token;

        let url = format!(
            "{}/repositories/{}/tags/{}/",
            DOCKER_HUB_API_URL, reference.repository, tag
        );
        tracing::debug!(url = %url, "Deleting Docker Hub tag");

        let delete = self
            .http
            .delete(&url)
            .header(AUTHORIZATION, format!("JWT {}", token));
        let response = self.send(reference, delete).await?;
        if !response.status().is_success() {
            return Err(prune_error(
                reference,
                format!("Docker Hub returned {} for tag delete", response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageRemover for RegistryPruner {
    async fn delete(&self, reference: &ImageReference, digest: &str) -> Result<()> {
        tracing::info!(reference = %reference, digest = %digest, "Pruning image");

        if reference.is_docker_hub() {
            self.delete_hub_tag(reference).await
        } else {
            self.delete_manifest(reference, digest).await
        }
    }
}

fn prune_error(reference: &ImageReference, message: String) -> BundleError {
    BundleError::Prune {
        reference: reference.to_string(),
        message,
    }
}

/// Parse a `Bearer realm="...",service="..."` challenge.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    for (key, value) in challenge_params(params) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm.filter(|r| !r.is_empty())?,
        service,
    })
}

/// Split `key="value",key=value` pairs; quoted values may contain commas.
fn challenge_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = params.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }

        out.push((key.trim().to_string(), value.trim().to_string()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    fn pruner(credential: Credential) -> RegistryPruner {
        RegistryPruner::new(&ClientOptions::new(credential, CancellationToken::new()))
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/bundle:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
    }

    #[test]
    fn test_parse_bearer_challenge_scope_with_commas() {
        let challenge = parse_bearer_challenge(
            r#"Bearer scope="repository:a/b:pull,push", realm="https://auth.example.com/token""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn test_parse_bearer_challenge_unquoted() {
        let challenge =
            parse_bearer_challenge("bearer realm=https://quay.io/v2/auth,service=quay.io").unwrap();
        assert_eq!(challenge.realm, "https://quay.io/v2/auth");
        assert_eq!(challenge.service.as_deref(), Some("quay.io"));
    }

    #[test]
    fn test_parse_non_bearer_challenge() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_bearer_challenge("Bearer").is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn test_token_response_prefers_token() {
        let r: TokenResponse = serde_json::from_str(r#"{"token":"t1","access_token":"t2"}"#).unwrap();
        assert_eq!(r.into_token().as_deref(), Some("t1"));

        let r: TokenResponse = serde_json::from_str(r#"{"access_token":"t2"}"#).unwrap();
        assert_eq!(r.into_token().as_deref(), Some("t2"));

        let r: TokenResponse = serde_json::from_str(r#"{"token":""}"#).unwrap();
        assert_eq!(r.into_token(), None);
    }

    #[tokio::test]
    async fn test_docker_hub_digest_reference_cannot_be_pruned() {
        let reference = ImageReference::parse(&format!("myuser/bundle@{}", DIGEST)).unwrap();
        let err = pruner(Credential::basic("u", "p"))
            .delete(&reference, DIGEST)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Prune { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_docker_hub_requires_credentials() {
        let reference = ImageReference::parse("myuser/bundle:v1").unwrap();
        let err = pruner(Credential::Anonymous)
            .delete(&reference, DIGEST)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires username and password"));
    }

    #[tokio::test]
    async fn test_cancelled_prune() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pruner = RegistryPruner::new(&ClientOptions::new(Credential::Anonymous, cancel));
        let reference = ImageReference::parse("registry.example.com/org/bundle:v1").unwrap();

        let err = pruner.delete(&reference, DIGEST).await.unwrap_err();
        assert!(matches!(err, BundleError::Cancelled));
    }
}
