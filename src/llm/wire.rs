//! Chat-completions wire format.
//!
//! Response DTOs are deliberately lenient (every field optional) so that a
//! missing key turns into `MalformedResponse` from [`into_response`] instead
//! of a serde error with no context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::types::{CompletionRequest, CompletionResponse, FinishReason, Usage};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub fn to_payload(request: &CompletionRequest) -> Result<serde_json::Value, ExecutionError> {
    let params = request.params();
    let body = ChatRequest {
        model: request.model(),
        messages: request
            .messages()
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        temperature: params.temperature,
        max_tokens: params.max_tokens,
    };
    serde_json::to_value(&body)
        .map_err(|e| ExecutionError::InvalidRequest(format!("failed to encode request: {}", e)))
}

/// Parses and validates a successful response body.
pub fn into_response(body: &str) -> Result<CompletionResponse, ExecutionError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ExecutionError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ExecutionError::MalformedResponse("no choices in response".to_string()))?;

    let text = choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| ExecutionError::MalformedResponse("choice has no text content".to_string()))?;

    let usage = parsed
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        text,
        finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
        usage,
        id: parsed.id,
        model: parsed.model,
        created: parsed.created.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
    })
}

/// Best-effort human readable message from an error body.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}
