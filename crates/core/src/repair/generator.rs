use std::sync::Arc;
use std::time::Duration;

use mender_llm::provider::{ChatMessage, CompletionRequest, LlmError, LlmProvider, StopReason};
use serde::Deserialize;
use serde_json::Value;

use super::prompt::{SYSTEM_PROMPT, build_repair_prompt};
use crate::types::{FilePatch, PreviewError, RepairContext};

/// Why the patch-generation capability produced no usable patch set.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("generator refused: {0}")]
    Refused(String),
    #[error("generator unavailable: {0}")]
    Provider(#[from] LlmError),
    #[error("malformed patch response: {0}")]
    Malformed(String),
    #[error("generation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("attempt abandoned")]
    Abandoned,
}

/// External capability that proposes a patch set for one error.
#[async_trait::async_trait]
pub trait PatchGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        error: &PreviewError,
        context: &RepairContext,
    ) -> Result<Vec<FilePatch>, GenerationError>;
}

/// Patch generator backed by a chat-completion provider.
pub struct LlmPatchGenerator {
    provider: Arc<dyn LlmProvider>,
    max_tokens: u32,
    temperature: f32,
}

impl LlmPatchGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_tokens: 8192,
            temperature: 0.2,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait::async_trait]
impl PatchGenerator for LlmPatchGenerator {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn generate(
        &self,
        error: &PreviewError,
        context: &RepairContext,
    ) -> Result<Vec<FilePatch>, GenerationError> {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(build_repair_prompt(error, context)),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let response = self.provider.complete(request).await?;
        tracing::debug!(
            provider = self.provider.name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "patch response received"
        );

        match response.stop_reason {
            StopReason::Refusal => {
                let reason = response.content.trim();
                Err(GenerationError::Refused(if reason.is_empty() {
                    "no reason given".into()
                } else {
                    reason.to_string()
                }))
            }
            StopReason::MaxTokens => parse_patches(&response.content).map_err(|_| {
                GenerationError::Malformed(format!("response truncated at {} tokens", self.max_tokens))
            }),
            StopReason::EndTurn => parse_patches(&response.content),
        }
    }
}

#[derive(Deserialize)]
struct PatchReply {
    #[serde(default)]
    patches: Vec<FilePatch>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Parse `{"patches": [...], "refusal"?: "..."}` or a bare patch array,
/// optionally wrapped in a markdown fence.
pub fn parse_patches(response: &str) -> Result<Vec<FilePatch>, GenerationError> {
    let body = strip_fence(response);
    let value: Value =
        serde_json::from_str(body).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    if value.is_array() {
        return serde_json::from_value(value).map_err(|e| GenerationError::Malformed(e.to_string()));
    }
    if !value.is_object() {
        return Err(GenerationError::Malformed("expected an object or array".into()));
    }
    let reply: PatchReply =
        serde_json::from_value(value).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    match reply.refusal {
        Some(reason) if reply.patches.is_empty() => Err(GenerationError::Refused(reason)),
        _ => Ok(reply.patches),
    }
}

fn strip_fence(response: &str) -> &str {
    let trimmed = response.trim();
    for fence in ["```json", "```"] {
        if let Some(after) = trimmed.strip_prefix(fence)
            && let Some(end) = after.rfind("```")
        {
            return after[..end].trim();
        }
    }
    trimmed
}
