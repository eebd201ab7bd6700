use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::{StatusCode, header};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::auth::Credential;
use super::progress::{FetchProgress, Silent};
use crate::manifest::{
    self, Descriptor, ImageConfig, ImageManifest, MANIFEST_ACCEPT, Manifest, Platform,
};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Header not found: {0}")]
    HeaderNotFound(String),

    #[error("Token fetch failed with status code {0}")]
    TokenFetchFailed(u16),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Unauthorized: {registry} answered {status}")]
    Unauthorized { registry: String, status: u16 },

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("No manifest for platform {0}")]
    PlatformNotFound(String),

    #[error("Manifest request failed with status code {0}")]
    ManifestFetchFailed(u16),

    #[error("Manifest parse error: {0}")]
    ManifestParseError(#[from] serde_json::Error),

    #[error("Blob {digest} download failed with status code {status}")]
    DownloadError { digest: String, status: u16 },

    #[error("Blob {digest} is larger than the {expected} bytes its descriptor declares")]
    BlobTooLarge { digest: String, expected: u64 },

    #[error("Blob digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Upper bound for buffer preallocation; sizes come from the server.
const PREALLOC_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

/// Client bound to one repository on one registry.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    registry_url: String,
    repository: String,
    credential: Credential,
    auth_token: Option<String>,
    progress: Arc<dyn FetchProgress>,
}

impl RegistryClient {
    pub fn new(registry_url: &str, repository: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("rummage/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            registry_url: registry_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            credential: Credential::Anonymous,
            auth_token: None,
            progress: Arc::new(Silent),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        if let Credential::Bearer(token) = &credential {
            self.auth_token = Some(token.clone());
        }
        self.credential = credential;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn FetchProgress>) -> Self {
        self.progress = progress;
        self
    }

    #[cfg(feature = "progress")]
    pub fn enable_progress(self) -> Self {
        self.with_progress(Arc::new(super::progress::BarProgress::new()))
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, self.repository, reference
        )
    }

    fn blob_url(&self, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry_url, self.repository, digest)
    }

    /// Probe `url` and, if the registry challenges us, obtain a bearer token.
    /// Must run before the client is shared across concurrent blob fetches.
    pub async fn authenticate(&mut self, url: &str) -> Result<()> {
        if self.auth_token.is_some() {
            return Ok(());
        }

        let response = self
            .http
            .head(url)
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        let value = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .ok_or_else(|| RegistryError::HeaderNotFound(header::WWW_AUTHENTICATE.to_string()))?
            .to_str()
            .map_err(|_| RegistryError::HeaderNotFound(header::WWW_AUTHENTICATE.to_string()))?;

        match parse_challenge(value) {
            Some(Challenge::Basic) => Ok(()),
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope = scope.unwrap_or_else(|| format!("repository:{}:pull", self.repository));
                let mut query = vec![("scope", scope)];
                if let Some(service) = service {
                    query.push(("service", service));
                }

                let mut request = self.http.get(&realm).query(&query);
                if let Credential::Basic { username, password } = &self.credential {
                    request = request.basic_auth(username, Some(password));
                }
                let response = request.send().await?;
                if !response.status().is_success() {
                    return Err(RegistryError::TokenFetchFailed(response.status().as_u16()));
                }

                let token: TokenResponse = response.json().await?;
                let token = token
                    .token
                    .or(token.access_token)
                    .ok_or(RegistryError::TokenNotFound)?;
                tracing::debug!(registry = %self.registry_url, "obtained registry token");
                self.auth_token = Some(token);
                Ok(())
            }
            None => Err(RegistryError::HeaderNotFound(format!(
                "usable {} challenge",
                header::WWW_AUTHENTICATE
            ))),
        }
    }

    fn with_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        } else if let Credential::Basic { username, password } = &self.credential {
            request = request.basic_auth(username, Some(password));
        }
        request
    }

    fn unauthorized(&self, status: StatusCode) -> RegistryError {
        RegistryError::Unauthorized {
            registry: self.registry_url.clone(),
            status: status.as_u16(),
        }
    }

    pub async fn get_manifest(&mut self, reference: &str) -> Result<Manifest> {
        let url = self.manifest_url(reference);
        self.authenticate(&url).await?;

        let response = self
            .with_auth(self.http.get(&url).header(header::ACCEPT, MANIFEST_ACCEPT))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(RegistryError::ManifestNotFound(format!(
                    "{}:{}",
                    self.repository, reference
                )));
            }
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(self.unauthorized(status));
            }
            status => return Err(RegistryError::ManifestFetchFailed(status.as_u16())),
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(content_type) = &content_type {
            if !manifest::is_supported_media_type(content_type)
                && !content_type.starts_with("application/json")
            {
                return Err(RegistryError::UnsupportedContentType(content_type.clone()));
            }
        }

        let body = response.bytes().await?;
        Ok(Manifest::from_slice(content_type.as_deref(), &body)?)
    }

    /// Resolve `reference` to a single image manifest, following an index to
    /// the entry for `platform`.
    pub async fn get_image_manifest(
        &mut self,
        reference: &str,
        platform: Option<&Platform>,
    ) -> Result<ImageManifest> {
        match self.get_manifest(reference).await? {
            Manifest::Image(image) => Ok(image),
            Manifest::Index(index) => {
                let target = index.select(platform).ok_or_else(|| {
                    RegistryError::PlatformNotFound(
                        platform.map(ToString::to_string).unwrap_or_else(|| "any".to_string()),
                    )
                })?;
                let digest = target.digest.clone();
                tracing::debug!(%digest, "selected manifest from index");
                match self.get_manifest(&digest).await? {
                    Manifest::Image(image) => Ok(image),
                    Manifest::Index(_) => Err(RegistryError::UnsupportedContentType(
                        "nested image index".to_string(),
                    )),
                }
            }
        }
    }

    pub async fn get_config(&self, descriptor: &Descriptor) -> Result<ImageConfig> {
        let bytes = self.fetch_blob(descriptor).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Download a blob into memory and check it against its digest.
    pub async fn fetch_blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let digest = &descriptor.digest;
        let response = self
            .with_auth(self.http.get(self.blob_url(digest)))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(self.unauthorized(status));
            }
            status => {
                return Err(RegistryError::DownloadError {
                    digest: digest.clone(),
                    status: status.as_u16(),
                });
            }
        }

        // A size of zero means the descriptor did not declare one.
        let limit = (descriptor.size > 0).then_some(descriptor.size);
        let too_large = || RegistryError::BlobTooLarge {
            digest: digest.clone(),
            expected: descriptor.size,
        };
        let total = match (response.content_length(), limit) {
            (Some(length), Some(limit)) if length > limit => return Err(too_large()),
            (Some(length), _) => length,
            (None, limit) => limit.unwrap_or(0),
        };
        self.progress.begin(digest, total);

        let mut hasher = Sha256::new();
        let mut data = Vec::with_capacity(total.min(PREALLOC_LIMIT) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if limit.is_some_and(|limit| (data.len() + chunk.len()) as u64 > limit) {
                self.progress.finish(digest);
                return Err(too_large());
            }
            hasher.update(&chunk);
            data.extend_from_slice(&chunk);
            self.progress.advance(digest, chunk.len() as u64);
        }
        self.progress.finish(digest);

        verify_digest(digest, hasher)?;
        Ok(data)
    }
}

fn verify_digest(expected: &str, hasher: Sha256) -> Result<()> {
    // Only sha256 can be checked; other algorithms pass through.
    let Some(hex) = expected.strip_prefix("sha256:") else {
        return Ok(());
    };
    let actual = format!("{:x}", hasher.finalize());
    if actual.eq_ignore_ascii_case(hex) {
        Ok(())
    } else {
        Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual: format!("sha256:{actual}"),
        })
    }
}

/// Parse e.g. `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));
    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for (key, val) in split_params(params) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(val),
            "service" => service = Some(val),
            "scope" => scope = Some(val),
            _ => {}
        }
    }

    Some(Challenge::Bearer {
        realm: realm?,
        service,
        scope,
    })
}

/// Split `k="v",k2="v,2"` honoring quotes.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (val, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_string(), &after[end..]),
                None => (after.trim().to_string(), ""),
            }
        };
        out.push((key, val));
        rest = remainder.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }
    out
}
