//! Registry Client: a thin, stateless wire-level adapter to
//! a v2 content-addressable image registry.
//!
//! Grounded in `TobiasDeBruijn-DRC/src/docker.rs` for the raw-`reqwest`
//! calling convention, and in `Registry.py` for the exact status-code
//! branching contract (`json_get`, `get_manifest`, `delete_manifest`).

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::error::{CoreError, CoreResult};

/// Checked at each network boundary, before sending the next request
///. A run that is cancelled mid-pagination or mid-repo stops
/// without issuing further requests.
fn check_cancelled(cancel: &CancellationToken) -> CoreResult<()> {
    if cancel.is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v1+prettyjws, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/json",
);

/// Result of a manifest fetch: the `Docker-Content-Digest`, the parsed
/// body, and the response's `Content-Type`. A non-2xx response is
/// reported as all-empty — the caller decides whether that is a fault
///.
#[derive(Debug, Clone, Default)]
pub struct ManifestResponse {
    pub digest: String,
    pub body: Value,
    pub media_type: String,
}

impl ManifestResponse {
    pub fn is_present(&self) -> bool {
        !self.digest.is_empty()
    }
}

/// Stateless adapter to one registry host. Internally backed by
/// `reqwest::Client`, which is already reference-counted, so cloning a
/// `RegistryClient` is cheap and safe to share across concurrent
/// callers.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<String>,
}

impl RegistryClient {
    pub fn host(&self) -> &str {
        self.base_url.trim_start_matches("https://")
    }

    /// `GET /v2` at construction time. A 200 confirms API v2; any other
    /// response fails construction with `RegistryUnavailable`.
    #[instrument(skip(timeout))]
    pub async fn connect(host: &str, timeout: Duration) -> CoreResult<RegistryClient> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| CoreError::RegistryUnavailable {
                host: host.to_string(),
                reason: source.to_string(),
                source: Some(source),
            })?;

        // A host that already names a scheme (an `http://127.0.0.1:port`
        // test registry, say) is used verbatim; a bare host is always
        // probed over https.
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{host}")
        };
        let probe_url = format!("{base_url}/v2/");
        let response =
            http.get(&probe_url)
                .send()
                .await
                .map_err(|source| CoreError::RegistryUnavailable {
                    host: host.to_string(),
                    reason: source.to_string(),
                    source: Some(source),
                })?;

        // Per spec.md §4.1/§7, any non-200 probe response is
        // `RegistryUnavailable` (fails construction), not
        // `RegistryError` (which is reserved for later list/tag calls).
        if response.status() != reqwest::StatusCode::OK {
            return Err(CoreError::RegistryUnavailable {
                host: host.to_string(),
                reason: format!("probe returned status {}", response.status().as_u16()),
                source: None,
            });
        }

        Ok(RegistryClient { http, base_url })
    }

    /// `GET /v2/_catalog`, following `Link: …; rel="next"` until
    /// exhausted. 404 returns empty; 400 is logged and returns empty;
    /// any other non-2xx is `RegistryError`.
    #[instrument(skip(self, cancel))]
    pub async fn list_repositories(&self, cancel: &CancellationToken) -> CoreResult<Vec<String>> {
        let first = format!("{}/v2/_catalog?n=10000", self.base_url);
        self.paginate_collect(first, cancel, |body: CatalogResponse| body.repositories)
            .await
    }

    /// `GET /v2/<repo>/tags/list`, same pagination and error policy as
    /// `list_repositories`.
    #[instrument(skip(self, cancel))]
    pub async fn list_tags(&self, repo: &str, cancel: &CancellationToken) -> CoreResult<Vec<String>> {
        let first = format!("{}/v2/{repo}/tags/list?n=10000", self.base_url);
        self.paginate_collect(first, cancel, |body: TagsResponse| body.tags)
            .await
    }

    async fn paginate_collect<T, F>(
        &self,
        first_url: String,
        cancel: &CancellationToken,
        extract: F,
    ) -> CoreResult<Vec<String>>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(T) -> Vec<String>,
    {
        let mut results = Vec::new();
        let mut next_url = Some(first_url);

        while let Some(url) = next_url.take() {
            check_cancelled(cancel)?;
            let response =
                self.http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|source| CoreError::RegistryUnavailable {
                        host: self.base_url.clone(),
                        reason: source.to_string(),
                        source: Some(source),
                    })?;

            match response.status() {
                reqwest::StatusCode::OK => {
                    next_url = parse_link_next(response.headers(), &url);
                    let body: T = response.json().await.map_err(|source| {
                        CoreError::RegistryUnavailable {
                            host: self.base_url.clone(),
                            reason: source.to_string(),
                            source: Some(source),
                        }
                    })?;
                    results.extend(extract(body));
                },
                reqwest::StatusCode::NOT_FOUND => {},
                reqwest::StatusCode::BAD_REQUEST => {
                    warn!(%url, "registry returned 400, treating as empty");
                },
                status => {
                    return Err(CoreError::RegistryError {
                        url,
                        status: status.as_u16(),
                    });
                },
            }
        }

        Ok(results)
    }

    /// Single GET with the manifest-list `Accept` header. On 2xx
    /// returns digest/body/media-type; on any non-2xx returns an empty
    /// response — the caller decides whether that is a fault.
    #[instrument(skip(self, cancel))]
    pub async fn get_manifest(
        &self,
        repo: &str,
        reference: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<ManifestResponse> {
        check_cancelled(cancel)?;
        let url = format!("{}/v2/{repo}/manifests/{reference}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|source| CoreError::RegistryUnavailable {
                host: self.base_url.clone(),
                reason: source.to_string(),
                source: Some(source),
            })?;

        if !response.status().is_success() {
            return Ok(ManifestResponse::default());
        }

        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        Ok(ManifestResponse {
            digest,
            body,
            media_type,
        })
    }

    /// `DELETE /v2/<repo>/manifests/<digest>`. 200/202 are success; any
    /// other status is a logged warning, never fatal (the manifest may
    /// already be gone, or deletion may be disabled).
    #[instrument(skip(self, cancel))]
    pub async fn delete_manifest(
        &self,
        repo: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<bool> {
        check_cancelled(cancel)?;
        let url = format!("{}/v2/{repo}/manifests/{digest}", self.base_url);
        let response = self.http.delete(&url).send().await.map_err(|source| {
            CoreError::RegistryUnavailable {
                host: self.base_url.clone(),
                reason: source.to_string(),
                source: Some(source),
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::ACCEPTED {
            Ok(true)
        } else {
            warn!(%repo, %digest, status = status.as_u16(), "manifest deletion did not succeed");
            Ok(false)
        }
    }
}

/// Parse a `Link: <url>; rel="next"` response header, resolving a
/// relative URL against `current_url`'s origin.
fn parse_link_next(headers: &reqwest::header::HeaderMap, current_url: &str) -> Option<String> {
    let raw = headers.get(reqwest::header::LINK)?.to_str().ok()?;

    for part in raw.split(',') {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let start = part.find('<')?;
        let end = part.find('>')?;
        let link = &part[start + 1..end];
        if link.starts_with("http://") || link.starts_with("https://") {
            return Some(link.to_string());
        }
        let origin_end = current_url.find("/v2/").unwrap_or(current_url.len());
        let origin = &current_url[..origin_end];
        return Some(format!("{origin}{link}"));
    }

    None
}
