//! Registry client contract (spec.md §6) and an HTTP implementation grounded
//! on the teacher's `ocidist::Client`: bearer-token caching with a
//! [`moka::future::Cache`], `WWW-Authenticate` challenge parsing, and
//! ratelimit-aware retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use moka::future::Cache;
use moka::Expiry;
use nom::bytes::complete::{tag, take_until};
use nom::character::complete::char;
use nom::sequence::delimited;
use nom::IResult;
use reqwest::header::{HeaderMap, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tokio::sync::RwLock;

use crate::model::Access;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authentication failed for {registry}: {reason}")]
    Auth { registry: String, reason: String },
    #[error("registry returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("unsupported access type: {0}")]
    UnsupportedAccess(String),
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
    #[error("rate limited by {registry}, retry after {retry_after:?}")]
    RateLimited {
        registry: String,
        retry_after: Option<Duration>,
    },
}

/// Dispatches digesting on access type, per spec.md §4.11: `ociRegistry`
/// hashes the fetched manifest bytes, `localOciBlob` hashes the blob bytes,
/// anything else is `unsupported-access`.
#[async_trait]
pub trait Digester: Send + Sync {
    async fn digest(&self, access: &Access) -> Result<String, Error>;
}

/// The pinned registry contract resources are pulled and pushed through.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn resolve_descriptor(&self, access: &Access) -> Result<crate::model::Descriptor, Error>;
    /// Fetch the raw manifest-or-index document at `reference`, returning
    /// its bytes and `Content-Type`.
    async fn pull_manifest(&self, reference: &str) -> Result<(Bytes, String), Error>;
    async fn pull_blob(&self, reference: &str, digest: &str) -> Result<Bytes, Error>;
    async fn push_blob(&self, reference: &str, digest: &str, content: Bytes) -> Result<(), Error>;
    async fn push_manifest(&self, reference: &str, manifest: Bytes, media_type: &str) -> Result<String, Error>;
}

/// The media type a component-descriptor blob is tagged with inside an OCI
/// manifest layer, per spec.md §4.2.
pub const COMPONENT_DESCRIPTOR_MEDIA_TYPE: &str = "application/vnd.ocm.software.component-descriptor.v2+yaml";

#[derive(Clone)]
struct Token {
    value: String,
}

struct TokenExpiry;

impl Expiry<String, (Token, Instant)> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(Token, Instant),
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.1.saturating_duration_since(Instant::now()))
    }
}

#[derive(Default)]
struct RatelimitState {
    blocked_until: Option<Instant>,
}

/// Generalises the teacher's read-only `ocidist::Client` with push support.
pub struct HttpRegistryClient {
    http: reqwest::Client,
    tokens: Cache<String, (Token, Instant)>,
    auth: ArcSwap<std::collections::HashMap<String, (String, String)>>,
    ratelimits: RwLock<std::collections::HashMap<String, RatelimitState>>,
}

impl HttpRegistryClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            tokens: Cache::builder().expire_after(TokenExpiry).build(),
            auth: ArcSwap::from_pointee(std::collections::HashMap::new()),
            ratelimits: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Install static `user:password` credentials for a registry host.
    pub fn set_credentials(&self, host: &str, username: &str, password: &str) {
        self.auth.rcu(|map| {
            let mut map = (**map).clone();
            map.insert(host.to_string(), (username.to_string(), password.to_string()));
            map
        });
    }

    async fn check_ratelimit(&self, host: &str) -> Result<(), Error> {
        let limits = self.ratelimits.read().await;
        if let Some(state) = limits.get(host) {
            if let Some(until) = state.blocked_until {
                if Instant::now() < until {
                    return Err(Error::RateLimited {
                        registry: host.to_string(),
                        retry_after: Some(until.saturating_duration_since(Instant::now())),
                    });
                }
            }
        }
        Ok(())
    }

    async fn record_ratelimit(&self, host: &str, retry_after: Duration) {
        let mut limits = self.ratelimits.write().await;
        limits.entry(host.to_string()).or_default().blocked_until = Some(Instant::now() + retry_after);
    }

    async fn bearer_token(&self, host: &str, challenge: &str) -> Result<String, Error> {
        let cache_key = format!("{host}|{challenge}");
        if let Some((token, _)) = self.tokens.get(&cache_key).await {
            return Ok(token.value);
        }

        let (realm, service, scope) = parse_bearer_challenge(challenge)
            .map_err(|_| Error::Auth { registry: host.to_string(), reason: "unparsable WWW-Authenticate".into() })?;

        let mut req = self.http.get(&realm).query(&[("service", &service), ("scope", &scope)]);
        if let Some((user, pass)) = self.auth.load().get(host) {
            req = req.basic_auth(user, Some(pass));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Auth { registry: host.to_string(), reason: format!("token endpoint returned {}", resp.status()) });
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
            expires_in: Option<u64>,
        }
        let body: TokenResponse = resp.json().await?;
        let value = body.token.or(body.access_token).ok_or_else(|| Error::Auth {
            registry: host.to_string(),
            reason: "token response missing token field".into(),
        })?;
        let ttl = Duration::from_secs(body.expires_in.unwrap_or(300));
        self.tokens
            .insert(cache_key, (Token { value: value.clone() }, Instant::now() + ttl))
            .await;
        Ok(value)
    }

    /// Send `build(req)`, and on a 401 with a bearer challenge fetch a token
    /// and retry once with it attached.
    async fn auth_and_retry(
        &self,
        host: &str,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        self.check_ratelimit(host).await?;

        let resp = build(&self.http).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(note_ratelimit(self, host, resp).await);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let Some(challenge) = challenge else {
            return Err(Error::Auth { registry: host.to_string(), reason: "401 without WWW-Authenticate".into() });
        };

        let token = self.bearer_token(host, &challenge).await?;
        let resp = build(&self.http)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await?;
        Ok(note_ratelimit(self, host, resp).await)
    }
}

async fn note_ratelimit(client: &HttpRegistryClient, host: &str, resp: reqwest::Response) -> reqwest::Response {
    if resp.status() == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after_duration(resp.headers());
        client.record_ratelimit(host, retry_after.unwrap_or(Duration::from_secs(30))).await;
        warn!("registry {host} rate limited us, backing off {retry_after:?}");
    }
    resp
}

fn retry_after_duration(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parses `Bearer realm="...",service="...",scope="..."` into its three parts.
fn parse_bearer_challenge(input: &str) -> Result<(String, String, String), nom::Err<nom::error::Error<&str>>> {
    fn quoted<'a>(key: &'static str) -> impl Fn(&'a str) -> IResult<&'a str, &'a str> {
        move |i: &'a str| {
            let (i, _) = take_until(key)(i)?;
            let (i, _) = tag(key)(i)?;
            let (i, _) = char('=')(i)?;
            delimited(char('"'), take_until("\""), char('"'))(i)
        }
    }
    let (_, realm) = quoted("realm")(input)?;
    let (_, service) = quoted("service").unwrap_or(("", ""));
    let (_, scope) = quoted("scope").unwrap_or(("", ""));
    Ok((realm.to_string(), service.to_string(), scope.to_string()))
}

fn host_of(reference: &str) -> &str {
    reference.split('/').next().unwrap_or(reference)
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve_descriptor(&self, access: &Access) -> Result<crate::model::Descriptor, Error> {
        let Access::OciRegistry { image_reference } = access else {
            return Err(Error::UnsupportedAccess(access.type_name().to_string()));
        };
        let host = host_of(image_reference);
        let manifest_url = format!("https://{image_reference}");
        debug!("resolving component descriptor via {manifest_url}");

        let resp = self
            .auth_and_retry(host, |c| c.get(&manifest_url).header("Accept", "application/vnd.oci.image.manifest.v1+json"))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status(), url: manifest_url });
        }
        let manifest: oci_spec::image::ImageManifest = resp.json().await?;

        let layer = manifest
            .layers()
            .iter()
            .find(|l| l.media_type().to_string() == COMPONENT_DESCRIPTOR_MEDIA_TYPE)
            .ok_or_else(|| Error::Status { status: StatusCode::NOT_FOUND, url: manifest_url.clone() })?;

        let blob = self.pull_blob(image_reference, &layer.digest().to_string()).await?;
        let descriptor: crate::model::Descriptor = serde_yaml::from_slice(&blob)
            .map_err(|e| Error::Auth { registry: host.to_string(), reason: format!("descriptor yaml: {e}") })?;
        Ok(descriptor)
    }

    async fn pull_manifest(&self, reference: &str) -> Result<(Bytes, String), Error> {
        let host = host_of(reference);
        let url = format!("https://{reference}");
        let resp = self
            .auth_and_retry(host, |c| {
                c.get(&url).header(
                    "Accept",
                    "application/vnd.oci.image.manifest.v1+json,application/vnd.oci.image.index.v1+json",
                )
            })
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status(), url });
        }
        let media_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        Ok((resp.bytes().await?, media_type))
    }

    async fn pull_blob(&self, reference: &str, digest: &str) -> Result<Bytes, Error> {
        let host = host_of(reference);
        let repo = reference.split('/').collect::<Vec<_>>();
        let repo_path = repo.get(1..repo.len().saturating_sub(1).max(1)).map(|s| s.join("/")).unwrap_or_default();
        let url = format!("https://{host}/v2/{repo_path}/blobs/{digest}");
        let resp = self.auth_and_retry(host, |c| c.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status(), url });
        }
        Ok(resp.bytes().await?)
    }

    async fn push_blob(&self, reference: &str, digest: &str, content: Bytes) -> Result<(), Error> {
        let host = host_of(reference);
        let repo = reference.split('/').collect::<Vec<_>>();
        let repo_path = repo.get(1..repo.len().saturating_sub(1).max(1)).map(|s| s.join("/")).unwrap_or_default();
        let url = format!("https://{host}/v2/{repo_path}/blobs/uploads/?digest={digest}");
        let body = content.clone();
        let resp = self
            .auth_and_retry(host, move |c| c.post(&url).body(body.clone()))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status(), url: format!("{host}/v2/{repo_path}/blobs/{digest}") });
        }
        Ok(())
    }

    async fn push_manifest(&self, reference: &str, manifest: Bytes, media_type: &str) -> Result<String, Error> {
        let host = host_of(reference);
        let url = format!("https://{reference}");
        let media_type = media_type.to_string();
        let body = manifest;
        let resp = self
            .auth_and_retry(host, move |c| c.put(&url).header("Content-Type", media_type.clone()).body(body.clone()))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status(), url });
        }
        resp.headers()
            .get("Docker-Content-Digest")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Status { status: StatusCode::BAD_GATEWAY, url: reference.to_string() })
    }
}

#[async_trait]
impl Digester for HttpRegistryClient {
    async fn digest(&self, access: &Access) -> Result<String, Error> {
        match access {
            Access::OciRegistry { image_reference } => {
                let host = host_of(image_reference);
                let url = format!("https://{image_reference}");
                let resp = self.auth_and_retry(host, |c| c.get(&url)).await?;
                let bytes = resp.bytes().await?;
                use sha2::Digest as _;
                let mut hasher = sha2::Sha256::new();
                hasher.update(&bytes);
                Ok(format!("sha256:{:x}", hasher.finalize()))
            }
            Access::LocalOciBlob { digest } => Ok(digest.clone()),
            other => Err(Error::UnsupportedAccess(other.type_name().to_string())),
        }
    }
}

/// Shared-ownership handle suitable for injecting into job runners.
pub type SharedRegistryClient = Arc<dyn RegistryClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo:pull""#;
        let (realm, service, scope) = parse_bearer_challenge(header).unwrap();
        assert_eq!(realm, "https://auth.example.com/token");
        assert_eq!(service, "registry.example.com");
        assert_eq!(scope, "repository:foo:pull");
    }

    #[test]
    fn host_of_splits_reference() {
        assert_eq!(host_of("registry.example.com/foo/bar:1.0"), "registry.example.com");
    }
}
