//! HTTP provider for patch generation.
//!
//! Two wire formats: Anthropic's Messages API for `claude-*` models, and the
//! OpenAI chat-completions format for everything else (OpenAI itself or any
//! compatible gateway behind `MENDER_LLM_BASE_URL`).

use crate::provider::{CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role, StopReason};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Wire format spoken by the configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Messages,
    ChatCompletions,
}

impl WireFormat {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().starts_with("claude-") {
            Self::Messages
        } else {
            Self::ChatCompletions
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Messages => "https://api.anthropic.com/v1",
            Self::ChatCompletions => "https://api.openai.com/v1",
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::ChatCompletions => "chat/completions",
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// LLM reached over HTTPS.
pub struct HttpProvider {
    format: WireFormat,
    model: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        let format = WireFormat::for_model(&model);
        let base = base_url.unwrap_or_else(|| format.default_base_url().to_owned());
        Self {
            format,
            model,
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url, self.format.path())
    }

    async fn post<B: Serialize>(&self, body: &B) -> Result<String, LlmError> {
        let builder = self.client.post(self.endpoint()).json(body);
        let builder = match self.format {
            WireFormat::Messages => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            WireFormat::ChatCompletions => builder.bearer_auth(&self.api_key),
        };
        let resp = builder
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(check_error(status, text));
        }
        Ok(text)
    }

    async fn complete_chat(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: role_str(&m.role),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let text = self.post(&body).await?;
        parse_chat(&text)
    }

    async fn complete_messages(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        // The Messages API takes the system prompt beside the turns.
        let system = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str());
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| WireMessage {
                    role: role_str(&m.role),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
        };
        let text = self.post(&body).await?;
        parse_messages(&text)
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// 429 is retryable later, 5xx means the service is down, the rest is ours.
fn check_error(status: reqwest::StatusCode, body: String) -> LlmError {
    tracing::debug!(%status, "llm request rejected");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited
    } else if status.is_server_error() {
        LlmError::Unavailable(format!("{status}: {body}"))
    } else {
        LlmError::RequestFailed(format!("{status}: {body}"))
    }
}

fn parse_chat(text: &str) -> Result<CompletionResponse, LlmError> {
    let api: ChatResponse =
        serde_json::from_str(text).map_err(|e| LlmError::RequestFailed(e.to_string()))?;
    let (input_tokens, output_tokens) = api
        .usage
        .map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
    let Some(choice) = api.choices.into_iter().next() else {
        return Err(LlmError::RequestFailed("response carried no choices".into()));
    };

    let stop_reason = if choice.message.refusal.is_some() {
        StopReason::Refusal
    } else {
        match choice.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            Some("content_filter") => StopReason::Refusal,
            _ => StopReason::EndTurn,
        }
    };
    let content = choice
        .message
        .content
        .or(choice.message.refusal)
        .unwrap_or_default();
    Ok(CompletionResponse {
        content,
        stop_reason,
        input_tokens,
        output_tokens,
    })
}

fn parse_messages(text: &str) -> Result<CompletionResponse, LlmError> {
    let api: MessagesResponse =
        serde_json::from_str(text).map_err(|e| LlmError::RequestFailed(e.to_string()))?;
    let content = api
        .content
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<String>();
    let stop_reason = match api.stop_reason.as_deref() {
        Some("max_tokens") => StopReason::MaxTokens,
        Some("refusal") => StopReason::Refusal,
        _ => StopReason::EndTurn,
    };
    let (input_tokens, output_tokens) = api
        .usage
        .map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
    Ok(CompletionResponse {
        content,
        stop_reason,
        input_tokens,
        output_tokens,
    })
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        match self.format {
            WireFormat::Messages => "anthropic",
            WireFormat::ChatCompletions => "chat-completions",
        }
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        match self.format {
            WireFormat::Messages => Box::pin(self.complete_messages(request)),
            WireFormat::ChatCompletions => Box::pin(self.complete_chat(request)),
        }
    }
}

/// Provider from `MENDER_LLM_MODEL`, `MENDER_LLM_API_KEY` and optionally
/// `MENDER_LLM_BASE_URL`. `None` when model or key is unset.
pub fn from_env() -> Option<HttpProvider> {
    let model = std::env::var("MENDER_LLM_MODEL").ok()?;
    let api_key = std::env::var("MENDER_LLM_API_KEY").ok()?;
    let base_url = std::env::var("MENDER_LLM_BASE_URL").ok();
    Some(HttpProvider::new(model, api_key, base_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_models_use_messages_format() {
        assert_eq!(WireFormat::for_model("claude-sonnet-4-5"), WireFormat::Messages);
        assert_eq!(WireFormat::for_model("Claude-3-opus"), WireFormat::Messages);
        assert_eq!(WireFormat::for_model("gpt-4o"), WireFormat::ChatCompletions);
        assert_eq!(WireFormat::for_model("llama-3"), WireFormat::ChatCompletions);
    }

    #[test]
    fn endpoints_follow_format_and_base_url() {
        let p = HttpProvider::new("gpt-4o".into(), "sk-test".into(), None);
        assert_eq!(p.endpoint(), "https://api.openai.com/v1/chat/completions");

        let p = HttpProvider::new("claude-sonnet-4-5".into(), "sk-ant-test".into(), None);
        assert_eq!(p.endpoint(), "https://api.anthropic.com/v1/messages");
        assert_eq!(p.name(), "anthropic");

        let p = HttpProvider::new("local-coder".into(), "k".into(), Some("http://gateway:8080/v1/".into()));
        assert_eq!(p.endpoint(), "http://gateway:8080/v1/chat/completions");
    }

    #[test]
    fn rate_limit_and_server_errors_are_distinguished() {
        let e = check_error(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(e, LlmError::RateLimited));
        let e = check_error(reqwest::StatusCode::BAD_GATEWAY, "down".into());
        assert!(matches!(e, LlmError::Unavailable(_)));
        let e = check_error(reqwest::StatusCode::BAD_REQUEST, "bad".into());
        assert!(matches!(e, LlmError::RequestFailed(_)));
    }

    #[test]
    fn chat_refusal_and_truncation_map_to_stop_reasons() {
        let refused = parse_chat(
            r#"{"choices":[{"message":{"content":null,"refusal":"I can't help"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(refused.stop_reason, StopReason::Refusal);
        assert_eq!(refused.content, "I can't help");

        let cut = parse_chat(
            r#"{"choices":[{"message":{"content":"[{\"path\""},"finish_reason":"length"}],
                "usage":{"prompt_tokens":10,"completion_tokens":4}}"#,
        )
        .unwrap();
        assert_eq!(cut.stop_reason, StopReason::MaxTokens);
        assert_eq!((cut.input_tokens, cut.output_tokens), (10, 4));

        assert!(parse_chat(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn messages_text_blocks_are_joined() {
        let resp = parse_messages(
            r#"{"content":[{"type":"text","text":"[{\"path\":"},{"type":"thinking"},{"type":"text","text":"\"a\"}]"}],
                "stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":5}}"#,
        )
        .unwrap();
        assert_eq!(resp.content, r#"[{"path":"a"}]"#);
        assert_eq!(resp.stop_reason, StopReason::EndTurn);

        let refused = parse_messages(r#"{"content":[],"stop_reason":"refusal"}"#).unwrap();
        assert_eq!(refused.stop_reason, StopReason::Refusal);
    }
}
