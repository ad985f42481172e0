//! HTTP client for the glidein controller API

use anyhow::{Context, Result};
use glidein_lib::{
    metrics::SeriesResponse,
    models::{ClusterId, GlideinRecord, JobSpec},
    queue::{HistoryEntry, JobFilter},
};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Non-success response from the API
#[derive(Debug, Error)]
#[error("API error ({status}): {message}")]
pub struct ApiError {
    pub status: StatusCode,
    /// Error kind reported by the server, when it sent one
    pub kind: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => ApiError {
                status,
                kind: Some(parsed.kind),
                message: parsed.error,
            },
            Err(_) => ApiError {
                status,
                kind: None,
                message: body,
            },
        };
        Err(error.into())
    }

    /// GET `path` with query parameters
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// POST a JSON body to `path`
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// Download raw bytes from an absolute URL, e.g. a presigned log URL
    pub async fn download(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        let bytes = Self::check(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    pub async fn submit(&self, spec: JobSpec, count: u32) -> Result<SubmitResponse> {
        self.post("v1/jobs", &SubmitRequest { spec, count }).await
    }

    pub async fn history(&self, cluster: Option<ClusterId>, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cluster) = cluster {
            query.push(("cluster", cluster.0.to_string()));
        }
        self.get("v1/jobs/history", &query).await
    }

    pub async fn remove(&self, filter: &JobFilter) -> Result<RemoveResponse> {
        self.post("v1/jobs/remove", filter).await
    }

    pub async fn glideins(&self, query: &GlideinQuery) -> Result<Vec<GlideinRecord>> {
        self.get("v1/glideins", &query.pairs()).await
    }

    pub async fn render(&self, target: &str, from: &str) -> Result<Vec<SeriesResponse>> {
        self.get(
            "render",
            &[("target", target.to_string()), ("from", from.to_string())],
        )
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub cluster: ClusterId,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub removed: usize,
}

/// Filters of `GET /v1/glideins`
#[derive(Debug, Clone, Default)]
pub struct GlideinQuery {
    pub site: Option<String>,
    pub partition: Option<String>,
    pub resources: Vec<String>,
    pub retired: bool,
}

impl GlideinQuery {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(site) = &self.site {
            pairs.push(("site", site.clone()));
        }
        if let Some(partition) = &self.partition {
            pairs.push(("partition", partition.clone()));
        }
        if !self.resources.is_empty() {
            pairs.push(("resources", self.resources.join(",")));
        }
        if self.retired {
            pairs.push(("retired", "true".to_string()));
        }
        pairs
    }
}
