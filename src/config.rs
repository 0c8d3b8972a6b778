use crate::error::ConfigError;
use crate::llm::openai::{chat_completions_url, DEFAULT_BASE_URL};
use crate::llm::{Credentials, RetryPolicy};
use secrecy::SecretString;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub honor_retry_after: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider_defaults = ProviderConfig::default();
        let retry_defaults = RetryConfig::default();

        Ok(Self {
            provider: ProviderConfig {
                api_key: lookup("OPENAI_API_KEY")
                    .filter(|k| !k.trim().is_empty())
                    .map(SecretString::from),
                base_url: lookup("OPENAI_BASE_URL").unwrap_or(provider_defaults.base_url),
                model: lookup("LLM_MODEL").unwrap_or(provider_defaults.model),
                timeout_secs: parse_or(&lookup, "LLM_TIMEOUT_SECS", provider_defaults.timeout_secs)?,
            },
            retry: RetryConfig {
                max_attempts: parse_or(&lookup, "LLM_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
                base_backoff_ms: parse_or(&lookup, "LLM_BASE_BACKOFF_MS", retry_defaults.base_backoff_ms)?,
                backoff_multiplier: parse_or(
                    &lookup,
                    "LLM_BACKOFF_MULTIPLIER",
                    retry_defaults.backoff_multiplier,
                )?,
                max_backoff_ms: parse_or(&lookup, "LLM_MAX_BACKOFF_MS", retry_defaults.max_backoff_ms)?,
                honor_retry_after: parse_or(
                    &lookup,
                    "LLM_HONOR_RETRY_AFTER",
                    retry_defaults.honor_retry_after,
                )?,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl ProviderConfig {
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        self.api_key
            .clone()
            .map(Credentials::from)
            .ok_or_else(|| ConfigError::MissingRequired("OPENAI_API_KEY".into()))
    }

    pub fn endpoint(&self) -> String {
        chat_completions_url(&self.base_url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            self.backoff_multiplier,
        )
        .map(|p| {
            p.with_max_backoff(Duration::from_millis(self.max_backoff_ms))
                .with_honor_retry_after(self.honor_retry_after)
        })
        .map_err(|e| ConfigError::InvalidValue(format!("retry policy ({})", e)))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: 120,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60000,
            honor_retry_after: false,
        }
    }
}
