use crate::classify::normalize::truncate_chars;
use crate::types::{PreviewError, RepairContext};

/// Longest stack excerpt placed in a prompt.
const PROMPT_STACK_CHARS: usize = 2000;

pub const SYSTEM_PROMPT: &str = "You repair runtime errors in a live web preview. \
Reply with JSON only: {\"patches\": [{\"path\": \"<existing file>\", \"newContent\": \"<full file>\"}]}. \
Only rewrite files listed in the context. If you cannot or will not fix the error, \
reply {\"patches\": [], \"refusal\": \"<reason>\"}.";

/// Build the user prompt for one repair attempt.
///
/// Includes the fault with its location and stacks, the operation that led
/// to it, every file in the context, and why earlier attempts failed.
pub fn build_repair_prompt(error: &PreviewError, context: &RepairContext) -> String {
    let mut prompt = String::with_capacity(4096);

    prompt.push_str(&format!("## Error ({}, {})\n", error.kind, error.severity.as_str()));
    prompt.push_str(&error.message);
    prompt.push('\n');
    if let Some(loc) = error.location() {
        prompt.push_str(&format!("at {loc}\n"));
    }
    if let Some(net) = &error.network {
        let status = net.status.map(|s| s.to_string()).unwrap_or_else(|| "no response".into());
        prompt.push_str(&format!("request: {} {} ({status})\n", net.method, net.url));
    }
    if let Some(stack) = &error.stack {
        prompt.push_str(&format!("\n### Stack\n```\n{}\n```\n", truncate_chars(stack, PROMPT_STACK_CHARS)));
    }
    if let Some(components) = &error.component_stack {
        prompt.push_str(&format!(
            "\n### Component stack\n```\n{}\n```\n",
            truncate_chars(components, PROMPT_STACK_CHARS)
        ));
    }

    if let Some(op) = &context.last_operation {
        prompt.push_str(&format!("\n## Last operation\n{op}\n"));
    }

    prompt.push_str("\n## Files\n");
    if let Some(active) = &context.active_file {
        prompt.push_str(&format!("Active file: {active}\n"));
    }
    for (path, content) in &context.files {
        prompt.push_str(&format!("\n### {path}\n```\n{content}\n```\n"));
    }

    if !context.prior_failures.is_empty() {
        prompt.push_str("\n## Previous failed attempts (avoid these mistakes)\n");
        for (i, summary) in context.prior_failures.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, summary));
        }
    }

    prompt.push_str("\nReturn the smallest patch set that fixes the error.\n");
    prompt
}
