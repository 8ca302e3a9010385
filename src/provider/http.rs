//! HTTP-backed provider clients.
//!
//! Thin reqwest clients speaking a JSON request/response protocol:
//! `POST {base}/generate`, `POST {base}/analyze`, `POST {base}/score`, and
//! `POST {base}/plan` for the planner. Status codes drive the error
//! taxonomy: 429 and 5xx are transient, other 4xx are structural, and an
//! unparseable body is a validation error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{
    AnalyzeRequest, GenerateRequest, GenerateResponse, GenerationProvider, PlannerProvider,
    PlannerRequest, PlannerResponse, ProviderError, ScoreRequest, ScoreResponse,
};

/// HTTP client for a generation/analysis/scoring provider.
pub struct HttpGenerationProvider {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpGenerationProvider {
    /// Creates a client for the given provider endpoint.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Structural(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            timeout,
        })
    }

    /// Returns the provider's base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ProviderError> {
        post_json(&self.client, &self.base_url, path, body, self.timeout).await
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::Validation(e.to_string()))?;
        self.post("/generate", &body).await
    }

    async fn analyze(&self, request: AnalyzeRequest) -> Result<Value, ProviderError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::Validation(e.to_string()))?;
        self.post("/analyze", &body).await
    }

    async fn score(&self, request: ScoreRequest) -> Result<ScoreResponse, ProviderError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::Validation(e.to_string()))?;
        self.post("/score", &body).await
    }
}

/// HTTP client for the planner provider.
pub struct HttpPlannerProvider {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpPlannerProvider {
    /// Creates a client for the given planner endpoint.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Structural(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            timeout,
        })
    }
}

#[async_trait]
impl PlannerProvider for HttpPlannerProvider {
    async fn plan(&self, request: PlannerRequest) -> Result<PlannerResponse, ProviderError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::Validation(e.to_string()))?;
        post_json(&self.client, &self.base_url, "/plan", &body, self.timeout).await
    }
}

/// Sends one JSON POST and maps the outcome onto the error taxonomy.
async fn post_json<T: DeserializeOwned>(
    client: &Client,
    base_url: &str,
    path: &str,
    body: &Value,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);

    let response = client.post(&url).json(body).send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::Transient(format!("request to {} failed: {}", url, e))
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &url, &text));
    }

    let value: Value = response
        .json()
        .await
        .map_err(|e| ProviderError::Validation(format!("unparseable response from {}: {}", url, e)))?;

    serde_json::from_value(value).map_err(|e| {
        ProviderError::Validation(format!("unexpected response shape from {}: {}", url, e))
    })
}

fn classify_status(status: StatusCode, url: &str, body: &str) -> ProviderError {
    let detail = format!("{} from {}: {}", status, url, truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(detail)
    } else {
        // 4xx other than 429: the provider rejected the request outright.
        ProviderError::Structural(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "http://p/generate", "slow down");
        assert!(err.is_transient());

        let err = classify_status(StatusCode::BAD_GATEWAY, "http://p/generate", "");
        assert!(err.is_transient());

        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "http://p/generate", "nope");
        assert!(err.is_structural());

        let err = classify_status(StatusCode::UNAUTHORIZED, "http://p/generate", "");
        assert!(err.is_structural());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 200), "short");
    }

    #[test]
    fn test_base_url_trailing_slash_normalized() {
        let provider =
            HttpGenerationProvider::new("http://localhost:8801/", Duration::from_secs(5))
                .expect("client");
        assert_eq!(provider.base_url(), "http://localhost:8801/");
        // The join in post_json trims the trailing slash; this just pins the
        // stored value.
    }
}
