//! HTTP provider for OpenAI-compatible chat-completions endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::call::{GenerationCall, GenerationProvider, RawCompletion};
use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Provider name used for health tracking and logs.
    pub name: String,
    /// Base URL, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(config: HttpProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn body(&self, call: &GenerationCall) -> JsonValue {
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": call.system_prompt },
                { "role": "user", "content": call.user_prompt },
            ],
        });
        if let Some(schema) = &call.schema {
            body["tools"] = json!([{
                "type": "function",
                "function": {
                    "name": schema.name,
                    "parameters": schema.to_json_schema(),
                },
            }]);
            body["tool_choice"] = json!({
                "type": "function",
                "function": { "name": schema.name },
            });
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn call(&self, call: &GenerationCall) -> Result<RawCompletion, ProviderError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .timeout(call.timeout)
            .json(&self.body(call));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(call.timeout)
            } else {
                ProviderError::unavailable(None, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after, body));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(call.timeout)
            } else {
                ProviderError::malformed(format!("response body is not a chat completion: {e}"))
            }
        })?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ProviderError::EmptyOutput);
        };

        debug!(
            provider = %self.config.name,
            substep = %call.substep,
            tool_calls = choice.message.tool_calls.len(),
            "chat completion received"
        );

        Ok(RawCompletion {
            text: choice.message.content,
            structured_args: choice
                .message
                .tool_calls
                .into_iter()
                .next()
                .and_then(|t| t.function.arguments),
            provider: self.config.name.clone(),
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }
}

fn map_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> ProviderError {
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        429 => ProviderError::RateLimited { retry_after },
        402 => ProviderError::PaymentRequired(snippet),
        code => ProviderError::unavailable(Some(code), format!("HTTP {code}: {snippet}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::ProviderTier;
    use crate::schema::OutputSchema;

    fn provider() -> HttpProvider {
        HttpProvider::new(HttpProviderConfig {
            name: "quality".into(),
            base_url: "http://localhost:9/v1/".into(),
            api_key: None,
            model: "big-model".into(),
        })
    }

    #[test]
    fn status_codes_map_onto_the_taxonomy() {
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), String::new()),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            map_status(StatusCode::PAYMENT_REQUIRED, None, "no credit".into()),
            ProviderError::PaymentRequired(msg) if msg == "no credit"
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, None, String::new()),
            ProviderError::Unavailable { status: Some(502), .. }
        ));
    }

    #[test]
    fn schema_becomes_a_forced_tool_call() {
        let call = GenerationCall::new("summary", "s", "u", Duration::from_secs(1), ProviderTier::Quality)
            .with_schema(OutputSchema::new("summary").text("logline"));
        let body = provider().body(&call);
        assert_eq!(body["model"], "big-model");
        assert_eq!(body["tools"][0]["function"]["name"], "summary");
        assert_eq!(body["tool_choice"]["function"]["name"], "summary");
        assert_eq!(provider().endpoint(), "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn plain_calls_carry_no_tools() {
        let call = GenerationCall::new("x", "s", "u", Duration::from_secs(1), ProviderTier::Fast);
        assert!(provider().body(&call).get("tools").is_none());
    }
}
