use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

use super::base::{Provider, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_context_length_error, messages_to_responses_spec, response_to_message,
    tools_to_responses_spec, InterruptedError,
};
use crate::models::message::Message;
use crate::models::tool::Tool;

/// How long a fetched model list stays fresh
const MODELS_TTL: Duration = Duration::from_secs(300);

/// A fetched model list together with the moment it was fetched
struct ModelCache {
    models: Vec<String>,
    fetched_at: Instant,
    ttl: Duration,
}

impl ModelCache {
    fn new(models: Vec<String>, ttl: Duration) -> Self {
        Self {
            models,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
    model_cache: Mutex<Option<ModelCache>>,
    interrupt: Option<Arc<Notify>>,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self {
            client,
            config,
            model_cache: Mutex::new(None),
            interrupt: None,
        })
    }

    /// Create a provider instance from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiProviderConfig::from_env()?)
    }

    /// Arm an interrupt handle for in-flight requests.
    ///
    /// When the handle is notified, a pending complete() resolves to
    /// InterruptedError instead of a provider error, so the caller can
    /// tell a user interruption apart from a genuine failure.
    pub fn with_interrupt(mut self, interrupt: Arc<Notify>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    fn get_usage(data: &Value) -> Result<Usage> {
        let usage = data
            .get("usage")
            .ok_or_else(|| anyhow!("No usage data in response"))?;

        let input_tokens = usage
            .get("input_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let output_tokens = usage
            .get("output_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let total_tokens = usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .or_else(|| match (input_tokens, output_tokens) {
                (Some(input), Some(output)) => Some(input + output),
                _ => None,
            });

        Ok(Usage::new(input_tokens, output_tokens, total_tokens))
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let url = format!("{}/v1/responses", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            _ => Err(anyhow!(
                "Request failed: {}\nPayload: {}",
                response.status(),
                payload
            )),
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let data: Value = response.json().await?;
                let models = data
                    .get("data")
                    .and_then(|v| v.as_array())
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(models)
            }
            status => Err(anyhow!("Failed to list models: {}", status)),
        }
    }

    /// Refetch the model list, replacing whatever is cached
    pub async fn refresh_models(&self) -> Result<Vec<String>> {
        let models = self.fetch_models().await?;
        let mut cache = self.model_cache.lock().await;
        *cache = Some(ModelCache::new(models.clone(), MODELS_TTL));
        Ok(models)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        let input = messages_to_responses_spec(messages);
        let tools_spec = if !tools.is_empty() {
            tools_to_responses_spec(tools)?
        } else {
            vec![]
        };

        // Responses are not stored server side, so the encrypted
        // reasoning state has to be requested explicitly for replay.
        let mut payload = json!({
            "model": self.config.model,
            "input": input,
            "instructions": system,
            "store": false,
            "include": ["reasoning.encrypted_content"],
        });

        if !tools_spec.is_empty() {
            payload
                .as_object_mut()
                .unwrap()
                .insert("tools".to_string(), json!(tools_spec));
        }
        if let Some(temp) = self.config.temperature {
            payload
                .as_object_mut()
                .unwrap()
                .insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            payload
                .as_object_mut()
                .unwrap()
                .insert("max_output_tokens".to_string(), json!(tokens));
        }

        let response = match &self.interrupt {
            Some(interrupt) => tokio::select! {
                _ = interrupt.notified() => return Err(InterruptedError.into()),
                response = self.post(payload) => response?,
            },
            None => self.post(payload).await?,
        };

        if let Some(error) = response.get("error") {
            if !error.is_null() {
                if let Some(err) = check_context_length_error(error) {
                    return Err(err.into());
                }
                return Err(anyhow!("OpenAI API error: {}", error));
            }
        }

        let message = response_to_message(response.clone())?;
        let usage = Self::get_usage(&response)?;

        Ok((message, usage))
    }

    async fn models(&self) -> Result<Vec<String>> {
        {
            let cache = self.model_cache.lock().await;
            if let Some(cache) = cache.as_ref() {
                if cache.is_fresh() {
                    return Ok(cache.models.clone());
                }
            }
        }
        self.refresh_models().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::MessageContent;
    use crate::providers::utils::ContextLengthExceededError;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(host: String) -> OpenAiProviderConfig {
        OpenAiProviderConfig {
            host,
            api_key: "test_api_key".to_string(),
            model: "computer-use-preview".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        }
    }

    async fn setup_mock_server(response_body: Value) -> (MockServer, OpenAiProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri())).unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let response_body = json!({
            "id": "resp_123",
            "object": "response",
            "error": null,
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": "Hello! How can I assist you today?"}]
            }],
            "usage": {
                "input_tokens": 12,
                "output_tokens": 15,
                "total_tokens": 27
            }
        });

        let (_, provider) = setup_mock_server(response_body).await;

        let messages = vec![Message::user().with_text("Hello?")];
        let (message, usage) = provider
            .complete("You are a helpful assistant.", &messages, &[])
            .await?;

        assert_eq!(
            message.content[0].as_text(),
            Some("Hello! How can I assist you today?")
        );
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(15));
        assert_eq!(usage.total_tokens, Some(27));

        Ok(())
    }

    #[tokio::test]
    async fn test_complete_tool_request() -> Result<()> {
        let response_body = json!({
            "id": "resp_tool",
            "object": "response",
            "error": null,
            "output": [{
                "type": "function_call",
                "call_id": "call_123",
                "name": "screen_click",
                "arguments": "{\"x\":100,\"y\":200}"
            }],
            "usage": {
                "input_tokens": 20,
                "output_tokens": 15,
                "total_tokens": 35
            }
        });

        let (_, provider) = setup_mock_server(response_body).await;

        let messages = vec![Message::user().with_text("Click the dock icon")];
        let tool = Tool::new(
            "screen_click",
            "Click at a screen coordinate",
            json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer"},
                    "y": {"type": "integer"}
                },
                "required": ["x", "y"]
            }),
        );

        let (message, usage) = provider
            .complete("You control the computer.", &messages, &[tool])
            .await?;

        if let MessageContent::ToolRequest(request) = &message.content[0] {
            assert_eq!(request.id, "call_123");
            assert_eq!(request.tool_call.name, "screen_click");
            assert_eq!(request.tool_call.arguments, json!({"x": 100, "y": 200}));
        } else {
            panic!("Expected ToolRequest content");
        }

        assert_eq!(usage.total_tokens, Some(35));

        Ok(())
    }

    #[tokio::test]
    async fn test_complete_interrupted() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": [], "usage": {}}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let interrupt = Arc::new(Notify::new());
        let provider = OpenAiProvider::new(test_config(mock_server.uri()))?
            .with_interrupt(interrupt.clone());

        interrupt.notify_one();

        let result = provider
            .complete("system", &[Message::user().with_text("hi")], &[])
            .await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<InterruptedError>().is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_models_served_from_cache_within_ttl() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    {"id": "computer-use-preview", "object": "model"},
                    {"id": "gpt-4o", "object": "model"}
                ]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri()))?;

        let first = provider.models().await?;
        let second = provider.models().await?;

        assert_eq!(first, vec!["computer-use-preview", "gpt-4o"]);
        assert_eq!(first, second);

        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_models_always_refetches() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{"id": "computer-use-preview", "object": "model"}]
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri()))?;

        provider.models().await?;
        let refreshed = provider.refresh_models().await?;

        assert_eq!(refreshed, vec!["computer-use-preview"]);

        Ok(())
    }

    #[test]
    fn test_model_cache_freshness() {
        let cache = ModelCache::new(vec!["computer-use-preview".to_string()], MODELS_TTL);
        assert!(cache.is_fresh());

        let stale = ModelCache::new(Vec::new(), Duration::ZERO);
        assert!(!stale.is_fresh());
    }

    #[tokio::test]
    async fn test_complete_api_error() -> Result<()> {
        let response_body = json!({
            "id": "resp_err",
            "object": "response",
            "error": {
                "code": "context_length_exceeded",
                "message": "This conversation is too long"
            },
            "output": [],
            "usage": {}
        });

        let (_, provider) = setup_mock_server(response_body).await;

        let result = provider
            .complete("system", &[Message::user().with_text("hi")], &[])
            .await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<ContextLengthExceededError>().is_some());

        Ok(())
    }
}
