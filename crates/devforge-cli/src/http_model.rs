//! An OpenAI-chat-completions-compatible `ModelProvider`, grounded in the
//! teacher's `config::check_endpoint` reqwest usage. Works against either
//! `OPENAI_API_KEY` (api.openai.com) or `OPENCLAW_KEY` (a local proxy), per
//! whichever the caller resolved.

use anyhow::Context;
use async_trait::async_trait;
use devforge_core::ports::{GenerateRequest, GenerateResponse, ModelProvider, TokenUsage};
use serde_json::json;

pub struct HttpModelProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpModelProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    async fn generate(&self, request: GenerateRequest) -> anyhow::Result<String> {
        Ok(self.generate_with_meta(request).await?.content)
    }

    async fn generate_with_meta(&self, request: GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "temperature": request.temperature,
        });
        if request.response_format_json {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("model request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("model API returned {status}: {text}");
        }

        let parsed: serde_json::Value = response.json().await.context("invalid model response body")?;
        let content = parsed["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
        let usage = parsed.get("usage").map(|u| TokenUsage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(GenerateResponse { content, tool_calls: Vec::new(), usage })
    }
}

/// Resolves the API key per spec.md's required-environment clause: one of
/// `OPENAI_API_KEY` or `OPENCLAW_KEY` must be set. Returns the key plus the
/// base URL/model pairing its presence implies.
pub fn resolve_from_env(model_override: Option<&str>) -> Option<HttpModelProvider> {
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = model_override.map(str::to_string).unwrap_or_else(|| "gpt-4o-mini".to_string());
        return Some(HttpModelProvider::new(base_url, key, model));
    }
    if let Ok(key) = std::env::var("OPENCLAW_KEY") {
        let base_url = std::env::var("OPENCLAW_BASE_URL").unwrap_or_else(|_| "http://localhost:8317/v1".to_string());
        let model = model_override.map(str::to_string).unwrap_or_else(|| "claude-sonnet-4-5".to_string());
        return Some(HttpModelProvider::new(base_url, key, model));
    }
    None
}
