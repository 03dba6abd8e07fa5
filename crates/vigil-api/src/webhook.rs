//! Webhook action handler.
//!
//! Posts each [`ActionDispatch`] as JSON to a configured endpoint. Transport
//! failures are retried with backoff; the executor's horizon bounds the whole
//! attempt. A 2xx answer may carry `{"reference": "..."}` which is kept as
//! the receipt reference.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use vigil_policy::handlers::{HandlerError, HandlerReceipt};
use vigil_policy::{ActionDispatch, ActionHandler};

use crate::retry::Backoff;

/// Longest response body quoted in a failure detail.
const MAX_DETAIL_BODY: usize = 512;

/// Delivers dispatches to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    http: reqwest::Client,
    url: Url,
}

impl WebhookHandler {
    /// Handler posting to `url`, each request bounded by `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, String> {
        let url = Url::parse(url).map_err(|e| format!("invalid webhook URL {url:?}: {e}"))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build webhook HTTP client: {e}"))?;
        Ok(Self { http, url })
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_DETAIL_BODY {
        let mut cut = MAX_DETAIL_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[async_trait]
impl ActionHandler for WebhookHandler {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn handle(&self, dispatch: &ActionDispatch) -> Result<HandlerReceipt, HandlerError> {
        let resp = Backoff::WEBHOOK
            .send("webhook", || {
                self.http
                    .post(self.url.clone())
                    .header("X-Vigil-Execution-Id", dispatch.execution_id.to_string())
                    .json(dispatch)
                    .send()
            })
            .await
            .map_err(|e| HandlerError::Unavailable(format!("POST {}: {e}", self.url)))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status.is_success() {
            let receipt = serde_json::from_str::<HandlerReceipt>(&body).unwrap_or_default();
            return Ok(receipt);
        }
        let detail = format!("webhook answered {status}: {}", truncate(body));
        if status.is_client_error() {
            Err(HandlerError::Rejected(detail))
        } else {
            Err(HandlerError::Unavailable(detail))
        }
    }
}
