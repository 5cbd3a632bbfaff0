use anyhow::{Context, Result};
use std::env;

/// Connection settings for the OpenAI Responses API
#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl OpenAiProviderConfig {
    /// Build a config from OPENAI_HOST, OPENAI_API_KEY and OPENAI_MODEL
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("OPENAI_HOST").unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key: env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY environment variable is required")?,
            model: env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "computer-use-preview".to_string()),
            temperature: None,
            max_tokens: None,
        })
    }
}
