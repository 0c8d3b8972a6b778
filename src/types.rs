use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

const MAX_TEMPERATURE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Optional sampling parameters. `None` leaves the provider default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A single completion request.
///
/// Always holds at least one message and a non-empty model; every constructor
/// checks this, so a value of this type is valid to send.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    model: String,
    messages: Vec<Message>,
    params: GenerationParams,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Result<Self, ExecutionError> {
        let request = Self {
            model: model.into(),
            messages,
            params: GenerationParams::default(),
        };
        request.validate()?;
        Ok(request)
    }

    /// One user message, the shape the CLI sends.
    pub fn prompt(model: impl Into<String>, text: impl Into<String>) -> Result<Self, ExecutionError> {
        Self::new(model, vec![Message::user(text)])
    }

    pub fn with_temperature(mut self, temperature: f32) -> Result<Self, ExecutionError> {
        self.params.temperature = Some(temperature);
        self.validate()?;
        Ok(self)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Result<Self, ExecutionError> {
        self.params.max_tokens = Some(max_tokens);
        self.validate()?;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.model.trim().is_empty() {
            return Err(ExecutionError::InvalidRequest("model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(ExecutionError::InvalidRequest(
                "at least one message is required".to_string(),
            ));
        }
        if let Some(t) = self.params.temperature {
            if !t.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&t) {
                return Err(ExecutionError::InvalidRequest(format!(
                    "temperature must be between 0 and {}, got {}",
                    MAX_TEMPERATURE, t
                )));
            }
        }
        if self.params.max_tokens == Some(0) {
            return Err(ExecutionError::InvalidRequest(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

impl FinishReason {
    /// Maps the provider's `finish_reason` string. A missing reason counts as
    /// a normal stop; anything unrecognised is reported as an error.
    pub fn from_wire(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some(_) => FinishReason::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}
