use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use completion_client::config::AppConfig;
use completion_client::llm::cancel;
use completion_client::llm::openai::HttpTransport;
use completion_client::{CompletionRequest, Message, RequestExecutor};

/// Send one chat-completion request and print the reply.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Prompt text. Read from stdin when omitted or `-`.
    prompt: Option<String>,

    /// Model identifier (defaults to LLM_MODEL, then gpt-3.5-turbo).
    #[arg(short, long)]
    model: Option<String>,

    /// Optional system message sent before the prompt.
    #[arg(short, long)]
    system: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Overrides LLM_MAX_ATTEMPTS.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Print the full response as JSON instead of just the text.
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::from_env().context("failed to load configuration")?;
    if let Some(max_attempts) = cli.max_attempts {
        config.retry.max_attempts = max_attempts;
    }

    let prompt = read_prompt(cli.prompt)?;
    let model = cli.model.unwrap_or_else(|| config.provider.model.clone());

    let mut messages = Vec::new();
    if let Some(system) = cli.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));

    let mut request = CompletionRequest::new(model, messages)?;
    if let Some(temperature) = cli.temperature {
        request = request.with_temperature(temperature)?;
    }
    if let Some(max_tokens) = cli.max_tokens {
        request = request.with_max_tokens(max_tokens)?;
    }

    let policy = config.retry.policy()?;
    let credentials = config.provider.credentials()?;
    let transport = HttpTransport::new(config.provider.timeout())?;
    let executor = RequestExecutor::new(Arc::new(transport), config.provider.endpoint(), credentials);

    let (handle, signal) = cancel::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling request");
            handle.cancel();
        }
    });

    let response = executor.execute_with_cancel(&request, &policy, &signal).await?;
    tracing::info!(
        model = response.model.as_deref().unwrap_or(request.model()),
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        "Completion received"
    );

    if cli.raw {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.text);
    }
    Ok(())
}

fn read_prompt(arg: Option<String>) -> anyhow::Result<String> {
    let prompt = match arg {
        Some(p) if p != "-" => p,
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read prompt from stdin")?;
            buf
        }
    };

    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        bail!("prompt is empty");
    }
    Ok(prompt)
}
