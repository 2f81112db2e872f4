use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bottle_backend::{Engagement, SubmitOutcome, Turn};

pub const DEFAULT_STORE_ID: &str = "default";

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResetResponse {
    reset: bool,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("BOTTLE_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let token = std::env::var("BOTTLE_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(&base_url),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list_turns(&self, store_id: &str) -> Result<Vec<Turn>> {
        self.request(
            reqwest::Method::GET,
            &format!("/v1/conversations/{}/turns", store_id),
        )
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("GET /v1/conversations/{}/turns failed", store_id))?
        .json::<Vec<Turn>>()
        .await
        .context("Failed to decode transcript")
    }

    pub async fn submit_turn(&self, store_id: &str, text: &str) -> Result<SubmitOutcome> {
        #[derive(Serialize)]
        struct SubmitTurnRequest<'a> {
            text: &'a str,
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/conversations/{}/turns", store_id),
            )
            .json(&SubmitTurnRequest { text })
            .send()
            .await?;

        // Validation failures come back as 400 with a readable message
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("{} ({})", body.trim(), status);
        }

        response
            .json::<SubmitOutcome>()
            .await
            .context("Failed to decode submit response")
    }

    pub async fn engagement(&self, store_id: &str) -> Result<Engagement> {
        self.request(
            reqwest::Method::GET,
            &format!("/v1/conversations/{}/engagement", store_id),
        )
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("GET /v1/conversations/{}/engagement failed", store_id))?
        .json::<Engagement>()
        .await
        .context("Failed to decode engagement")
    }

    pub async fn reset(&self, store_id: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/conversations/{}", store_id),
            )
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("DELETE /v1/conversations/{} failed", store_id))?
            .json::<ResetResponse>()
            .await
            .context("Failed to decode reset response")?;
        Ok(response.reset)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}
