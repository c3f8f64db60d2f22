use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use monadic_core::llm::openai_compatible::OpenAiCompatibleProvider;
use monadic_core::{
    Agent, MonadicSchema, RequestParameters, RuntimeConfig, TiktokenCounter, ToolRouter, UiEvent,
};

/// Send one chat turn and stream the reply to stdout.
#[derive(Parser)]
#[command(name = "monadic-chat", version)]
struct Cli {
    /// User message to send
    #[arg(short, long)]
    message: String,

    /// Ask for a `{message, context}` JSON reply
    #[arg(long)]
    monadic: bool,

    /// Envelope schema in monadic mode (basic or chat_plus)
    #[arg(long)]
    schema: Option<MonadicSchema>,

    /// Override the configured model
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("monadic_core=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Auto-generate config file on first run
    let config_path = RuntimeConfig::config_path()?;
    if !config_path.exists() {
        let path = RuntimeConfig::save_default()?;
        tracing::info!(path = %path.display(), "created default config, edit it to set api_key and model");
    }

    let config = RuntimeConfig::load()?;
    tracing::info!(
        provider = %config.provider.kind,
        model = %config.provider.model,
        api_base = config.provider.api_base.as_deref().unwrap_or("(default)"),
        "config loaded"
    );

    let provider = OpenAiCompatibleProvider::new(
        config.api_key()?,
        config.provider.api_base.clone(),
        config.provider.kind,
        config.connect_timeout(),
        config.read_timeout(),
    )?;

    let mut agent = Agent::new(
        Box::new(provider),
        Box::new(ToolRouter::new()),
        Arc::new(TiktokenCounter::new()),
        config,
    );
    agent.session_mut().set_parameters(RequestParameters {
        model: cli.model,
        monadic: cli.monadic.then_some(true),
        schema: cli.schema,
        ..Default::default()
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                UiEvent::Fragment(text) => {
                    print!("{}", text);
                    let _ = stdout.flush();
                }
                UiEvent::Wait(text) => eprintln!("\n[{}]", text),
                UiEvent::Partial(envelope) => tracing::debug!(%envelope, "partial envelope"),
                UiEvent::Message(_) => println!(),
                UiEvent::Error(text) => eprintln!("\n[Error: {}]", text),
            }
        }
    });

    // Ctrl-C cancels the in-flight turn
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = agent.process_message(&cli.message, &tx, &cancel).await;
    drop(tx);
    let _ = printer.await;

    match result {
        Ok(outcome) => {
            if let Some(envelope) = &outcome.envelope {
                println!("{}", serde_json::to_string_pretty(&envelope.to_value())?);
            }
            tracing::debug!(report = %agent.monitor().report(), "timings");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(kind = e.kind(), "exiting after failed turn");
            std::process::exit(1);
        }
    }
}
