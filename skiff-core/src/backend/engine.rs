//! Docker Engine HTTP API backend.
//!
//! Talks to an engine listening on TCP. Only streamed-archive builds are
//! supported: filesystem sync needs a session channel this client does not
//! open, so [`BackendCapabilities::fs_sync`] is always `false`.

use super::{
    BackendCapabilities, BackendError, BuildBackend, BuildContext, BuildRequest, BuilderVersion,
    ImageInspect, ResponseBody,
};
use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::types::ImageRef;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
}

/// Build backend backed by a Docker-compatible engine.
pub struct EngineBackend {
    client: Client,
    base_url: String,
    api_version: Option<String>,
}

/// Turn an engine host setting into an HTTP base URL.
fn base_url(host: &str) -> Result<String> {
    let invalid = |reason: &str| BuildError::InvalidConfig {
        reason: format!("engine host {:?}: {}", host, reason),
    };

    let url = if let Some(rest) = host.strip_prefix("tcp://") {
        format!("http://{}", rest)
    } else if host.starts_with("http://") {
        host.to_string()
    } else if host.starts_with("unix://") || host.starts_with("npipe://") {
        return Err(invalid("local sockets are not supported, expose the engine over tcp"));
    } else {
        return Err(invalid("expected tcp:// or http://"));
    };

    Ok(url.trim_end_matches('/').to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> std::result::Result<String, BackendError> {
    serde_json::to_string(value).map_err(|e| BackendError::InvalidRequest {
        reason: format!("encoding request option: {}", e),
    })
}

/// Query parameters of a build request.
fn build_query(
    request: &BuildRequest,
    version: &str,
) -> std::result::Result<Vec<(&'static str, String)>, BackendError> {
    let mut query =
        vec![("dockerfile", request.dockerfile.clone()), ("version", version.to_string())];
    if let Some(platform) = &request.platform {
        query.push(("platform", platform.clone()));
    }
    if !request.build_args.is_empty() {
        query.push(("buildargs", to_json(&request.build_args)?));
    }
    if !request.labels.is_empty() {
        query.push(("labels", to_json(&request.labels)?));
    }
    if let Some(target) = &request.target {
        query.push(("target", target.clone()));
    }
    if request.pull {
        query.push(("pull", "1".to_string()));
    }
    if !request.cache_from.is_empty() {
        query.push(("cachefrom", to_json(&request.cache_from)?));
    }
    if let Some(network) = &request.network {
        query.push(("networkmode", network.clone()));
    }
    Ok(query)
}

/// Wrap a streaming response body as an `AsyncRead`.
fn into_body(response: Response) -> ResponseBody {
    let stream = Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)));
    Box::new(StreamReader::new(stream))
}

impl EngineBackend {
    /// Create a client for the engine at `host` (`tcp://host:port` or `http://...`).
    pub fn new(host: &str, api_version: Option<&str>) -> Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build().map_err(|e| {
            BuildError::InvalidConfig { reason: format!("Failed to create HTTP client: {}", e) }
        })?;

        Ok(Self {
            client,
            base_url: base_url(host)?,
            api_version: api_version.map(|v| v.trim_start_matches('v').to_string()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.engine_host, config.api_version.as_deref())
    }

    fn url(&self, path: &str) -> String {
        match &self.api_version {
            Some(version) => format!("{}/v{}{}", self.base_url, version, path),
            None => format!("{}{}", self.base_url, path),
        }
    }

    fn connection_error(&self, e: reqwest::Error) -> BackendError {
        BackendError::Connection { endpoint: self.base_url.clone(), reason: e.to_string() }
    }

    async fn api_error(response: Response) -> BackendError {
        let status = response.status().as_u16();
        let message = match response.text().await {
            Ok(body) => serde_json::from_str::<ApiMessage>(&body)
                .map(|m| m.message)
                .unwrap_or_else(|_| body.trim().to_string()),
            Err(e) => e.to_string(),
        };
        BackendError::Api { status, message }
    }
}

#[async_trait]
impl BuildBackend for EngineBackend {
    #[instrument(skip(self))]
    async fn capabilities(&self) -> std::result::Result<BackendCapabilities, BackendError> {
        let response = self
            .client
            .get(self.url("/_ping"))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let header = response.headers().get("Builder-Version").and_then(|v| v.to_str().ok());
        let builder = match header {
            Some("2") => BuilderVersion::BuildKit,
            _ => BuilderVersion::Legacy,
        };
        debug!(?builder, "Engine capabilities");
        Ok(BackendCapabilities { builder, fs_sync: false })
    }

    #[instrument(
        skip(self, request),
        fields(platform = ?request.platform, force_legacy = request.force_legacy)
    )]
    async fn image_build(
        &self,
        request: BuildRequest,
    ) -> std::result::Result<ResponseBody, BackendError> {
        let version = if request.force_legacy {
            "1"
        } else {
            match self.capabilities().await?.builder {
                BuilderVersion::BuildKit => "2",
                BuilderVersion::Legacy => "1",
            }
        };

        let query = build_query(&request, version)?;

        let archive = match request.context {
            BuildContext::Archive(archive) => archive,
            BuildContext::Synced(_) => {
                return Err(BackendError::Unsupported {
                    feature: "filesystem-sync build context".to_string(),
                })
            }
        };

        let response = self
            .client
            .post(self.url("/build"))
            .query(&query)
            .header("Content-Type", "application/x-tar")
            .body(Body::wrap_stream(archive.into_stream()))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(into_body(response))
    }

    #[instrument(skip(self))]
    async fn image_inspect(
        &self,
        reference: &str,
    ) -> std::result::Result<ImageInspect, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/images/{}/json", reference)))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                Err(BackendError::NotFound { reference: reference.to_string() })
            }
            status if status.is_success() => {
                let inspect: InspectResponse = response.json().await.map_err(|e| {
                    BackendError::Api { status: status.as_u16(), message: e.to_string() }
                })?;
                Ok(ImageInspect { id: inspect.id })
            }
            _ => Err(Self::api_error(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn image_tag(&self, source: &str, target: &str) -> std::result::Result<(), BackendError> {
        let target_ref = ImageRef::parse(target)
            .map_err(|e| BackendError::InvalidRequest { reason: e.to_string() })?;

        let mut query = vec![("repo", target_ref.name().to_string())];
        if let Some(tag) = target_ref.tag() {
            query.push(("tag", tag.to_string()));
        }

        let response = self
            .client
            .post(self.url(&format!("/images/{}/tag", source)))
            .query(&query)
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound { reference: source.to_string() }),
            status if status.is_success() => Ok(()),
            _ => Err(Self::api_error(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn image_push(&self, reference: &str) -> std::result::Result<ResponseBody, BackendError> {
        let image_ref = ImageRef::parse(reference)
            .map_err(|e| BackendError::InvalidRequest { reason: e.to_string() })?;

        // The engine requires the header even when no credentials are sent
        let auth = base64::engine::general_purpose::URL_SAFE.encode("{}");

        let mut request = self
            .client
            .post(self.url(&format!("/images/{}/push", image_ref.name())))
            .header("X-Registry-Auth", auth);
        if let Some(tag) = image_ref.tag() {
            request = request.query(&[("tag", tag)]);
        }

        let response = request.send().await.map_err(|e| self.connection_error(e))?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                Err(BackendError::NotFound { reference: reference.to_string() })
            }
            status if status.is_success() => Ok(into_body(response)),
            _ => Err(Self::api_error(response).await),
        }
    }

    fn name(&self) -> &str {
        "engine"
    }
}
