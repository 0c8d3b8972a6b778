//! Resilient chat-completion client: one request through an injected
//! transport, bounded retries with exponential backoff, typed failures.

pub mod config;
pub mod error;
pub mod llm;
pub mod types;

pub use error::{ConfigError, ExecutionError, FailureKind, TransportError};
pub use llm::{CancelHandle, CancelSignal, Credentials, RawResponse, RequestExecutor, RetryPolicy, Transport};
pub use types::{CompletionRequest, CompletionResponse, FinishReason, Message, Role, Usage};
