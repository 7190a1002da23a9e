//! Model discovery against a Hugging Face style registry
//!
//! Candidates can be named concretely (`org/name`) or by family (`qwen2.5-vl`).
//! Families are expanded by searching the registry, most downloaded first, so
//! the head of the list favours well-vetted models.
//!
//! Rate-limited requests (HTTP 429) are retried on a fixed schedule; every
//! other failure is returned immediately.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

/// Delays before each retry of a rate-limited request
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Registry failures, classified so callers can react per class
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry rate limit persisted after {attempts} attempts")]
    RateLimited { attempts: usize },

    #[error("Registry rejected the token (HTTP 401). Run `login` with a valid token")]
    Unauthorized,

    #[error("Registry denied access (HTTP 403){}", .model.as_ref().map(|m| format!(" to {m}")).unwrap_or_default())]
    Forbidden { model: Option<String> },

    #[error("Registry request failed: HTTP {status}")]
    Http { status: u16 },

    #[error("Registry unreachable: {0}")]
    Network(String),

    #[error("Failed to decode registry response: {0}")]
    Decode(String),

    #[error("Discovery found no candidates for {0:?}")]
    NoCandidates(Vec<String>),
}

/// One model as listed by the registry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelDescriptor {
    #[serde(alias = "modelId")]
    pub id: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pipeline_tag: Option<String>,
    /// Download requires approval; the registry sends a bool or a string
    #[serde(default, deserialize_with = "deserialize_gated")]
    pub gated: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GatedField {
    Flag(bool),
    Mode(serde::de::IgnoredAny),
}

fn deserialize_gated<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Option::<GatedField>::deserialize(d)? {
        Some(GatedField::Flag(flag)) => flag,
        Some(GatedField::Mode(_)) => true,
        None => false,
    })
}

/// Search parameters
#[derive(Debug, Clone)]
pub struct SearchFilters {
    /// Required capability, e.g. `image-text-to-text`
    pub capability: Option<String>,
    pub limit: usize,
}

/// Raw HTTP exchange with the registry
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Transport used by [`RegistryClient`]
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        token: Option<&str>,
    ) -> Result<RawResponse, RegistryError>;
}

/// reqwest transport against a registry base URL
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("document-benchmark/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        token: Option<&str>,
    ) -> Result<RawResponse, RegistryError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut request = self.http.get(&url).query(query);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        Ok(RawResponse { status, body })
    }
}

/// Registry client with rate-limit retries
pub struct RegistryClient<T = HttpTransport> {
    transport: T,
    token: Option<String>,
    retry_delays: Vec<Duration>,
}

impl RegistryClient<HttpTransport> {
    pub fn connect(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RegistryError> {
        Ok(Self::with_transport(HttpTransport::new(base_url)?, token))
    }
}

impl<T: RegistryTransport> RegistryClient<T> {
    pub fn with_transport(transport: T, token: Option<String>) -> Self {
        Self {
            transport,
            token,
            retry_delays: RETRY_DELAYS.to_vec(),
        }
    }

    /// Search models, most downloaded first
    pub async fn search_models(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<ModelDescriptor>, RegistryError> {
        let mut params = vec![
            ("search".to_string(), query.to_string()),
            ("sort".to_string(), "downloads".to_string()),
            ("direction".to_string(), "-1".to_string()),
            ("limit".to_string(), filters.limit.to_string()),
        ];
        if let Some(capability) = &filters.capability {
            params.push(("pipeline_tag".to_string(), capability.clone()));
        }

        let body = self.get_with_retry("/api/models", &params, None).await?;
        let mut models: Vec<ModelDescriptor> =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;

        // Stable: registry order breaks download ties
        models.sort_by(|a, b| b.downloads.cmp(&a.downloads));
        models.truncate(filters.limit);
        tracing::debug!("Registry search {:?} returned {} models", query, models.len());
        Ok(models)
    }

    /// Whether a model requires approval before download
    pub async fn is_gated(&self, model_id: &str) -> Result<bool, RegistryError> {
        let path = format!("/api/models/{}", model_id);
        let body = self.get_with_retry(&path, &[], Some(model_id)).await?;
        let descriptor: ModelDescriptor =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(descriptor.gated)
    }

    async fn get_with_retry(
        &self,
        path: &str,
        query: &[(String, String)],
        model: Option<&str>,
    ) -> Result<String, RegistryError> {
        let mut attempt = 0;
        loop {
            let response = self
                .transport
                .get(path, query, self.token.as_deref())
                .await?;

            match response.status {
                200..=299 => return Ok(response.body),
                429 => {
                    let Some(delay) = self.retry_delays.get(attempt).copied() else {
                        return Err(RegistryError::RateLimited {
                            attempts: attempt + 1,
                        });
                    };
                    attempt += 1;
                    tracing::warn!(
                        "Registry rate limited, retry {}/{} in {:?}",
                        attempt,
                        self.retry_delays.len(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                401 => return Err(RegistryError::Unauthorized),
                403 => {
                    return Err(RegistryError::Forbidden {
                        model: model.map(String::from),
                    })
                }
                status => return Err(RegistryError::Http { status }),
            }
        }
    }
}

/// Concrete identifiers have exactly one `/` with text on both sides
pub fn is_concrete(model_id: &str) -> bool {
    match model_id.split_once('/') {
        Some((namespace, name)) => {
            !namespace.is_empty() && !name.is_empty() && !name.contains('/')
        }
        None => false,
    }
}

/// A candidate model after discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub id: String,
    pub gated: bool,
}

/// Expand family identifiers into concrete models
///
/// Concrete identifiers pass through unchanged and keep their position.
/// Each family contributes up to `filters.limit` models. Gated models are
/// dropped when `skip_gated` is set, otherwise kept and flagged. Duplicates
/// are removed, first occurrence wins.
pub async fn resolve_candidates<T: RegistryTransport>(
    client: &RegistryClient<T>,
    entries: &[String],
    filters: &SearchFilters,
    skip_gated: bool,
) -> Result<Vec<ResolvedModel>, RegistryError> {
    fn push(model: ResolvedModel, resolved: &mut Vec<ResolvedModel>) {
        if !resolved.iter().any(|m| m.id == model.id) {
            resolved.push(model);
        }
    }

    let mut resolved: Vec<ResolvedModel> = Vec::new();

    for entry in entries {
        if is_concrete(entry) {
            push(ResolvedModel { id: entry.clone(), gated: false }, &mut resolved);
            continue;
        }

        let found = client.search_models(entry, filters).await?;
        let total = found.len();
        let mut kept = 0;
        for model in found {
            if model.gated && skip_gated {
                tracing::info!("Skipping gated model {}", model.id);
                continue;
            }
            kept += 1;
            push(ResolvedModel { id: model.id, gated: model.gated }, &mut resolved);
        }
        if kept == 0 {
            tracing::warn!("Family {:?}: none of {} discovered models kept", entry, total);
        } else {
            tracing::info!("Family {:?}: {} of {} discovered models kept", entry, kept, total);
        }
    }

    if resolved.is_empty() {
        return Err(RegistryError::NoCandidates(entries.to_vec()));
    }
    Ok(resolved)
}

/// Pair two pools in diagonal order (increasing sum of indices)
///
/// Any prefix of the result samples both pools broadly instead of pairing
/// the first element of one pool with every element of the other.
pub fn diagonal_pairs<A: Clone, B: Clone>(left: &[A], right: &[B]) -> Vec<(A, B)> {
    let mut pairs = Vec::with_capacity(left.len() * right.len());
    if left.is_empty() || right.is_empty() {
        return pairs;
    }
    for sum in 0..(left.len() + right.len() - 1) {
        for i in 0..=sum {
            let j = sum - i;
            if i < left.len() && j < right.len() {
                pairs.push((left[i].clone(), right[j].clone()));
            }
        }
    }
    pairs
}
