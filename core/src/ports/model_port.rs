//! The Model port: the only capability through which the core talks to a
//! code-generation model. Concrete wiring (which API, which auth) is an
//! adapter's job — see the CLI crate's HTTP-backed implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub response_format_json: bool,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            response_format_json: false,
            temperature: 0.1,
            max_tokens: None,
        }
    }

    pub fn json(mut self) -> Self {
        self.response_format_json = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> anyhow::Result<String>;
    async fn generate_with_meta(
        &self,
        request: GenerateRequest,
    ) -> anyhow::Result<GenerateResponse>;
}
