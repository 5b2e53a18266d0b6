//! Hosted chat-model client.
//!
//! One entry point, [`chat`], shared by the analysis pipeline and the
//! answer engine. Calls an OpenAI-compatible `POST /chat/completions`
//! endpoint. Requires the `OPENAI_API_KEY` environment variable when the
//! provider is enabled; every failure comes back as
//! [`Error::RemoteService`] so callers can log and fall back locally.

use std::time::Duration;

use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Build the HTTP client used for model calls and URL extraction,
/// with the configured request timeout.
pub fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::RemoteService(format!("failed to build HTTP client: {}", e)))
}

/// Send one system+user exchange to the configured model and return the
/// assistant text.
pub async fn chat(
    config: &ModelConfig,
    client: &reqwest::Client,
    system: &str,
    user: &str,
) -> Result<String> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| Error::RemoteService("OPENAI_API_KEY not set".to_string()))?;

    let model = config
        .model
        .as_ref()
        .ok_or_else(|| Error::RemoteService("model.model not configured".to_string()))?;

    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "model": model,
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ],
        "temperature": 0.2,
    });

    let resp = client
        .post(&url)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::RemoteService(format!("model request failed: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(Error::RemoteService(format!(
            "model API returned {}",
            status
        )));
    }

    let payload: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| Error::RemoteService(format!("unparseable model response: {}", e)))?;

    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    Ok(content)
}
