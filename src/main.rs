use anyhow::{Context, Result};
use eapi_client::{ClientConfig, Command, CommandOutput, CommandResult};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ClientConfig::from_env().context("invalid EAPI_* configuration")?;
    let endpoint = config.endpoint();

    let mut commands: Vec<Command> = std::env::args().skip(1).map(Command::from).collect();
    if commands.is_empty() {
        commands.push(Command::new("show version"));
    }

    info!("Running {} command(s) on {}", commands.len(), endpoint);

    let pipeline = config.build_pipeline();
    let outcome = pipeline
        .execute(&endpoint, commands, &config.options)
        .await
        .with_context(|| format!("call to {} failed", endpoint))?;

    for (index, result) in outcome.results().into_iter().enumerate() {
        match result {
            CommandResult::Success(CommandOutput::Text(text)) => println!("{}", text),
            CommandResult::Success(CommandOutput::Json(value)) => {
                println!("{}", serde_json::to_string_pretty(&value)?)
            }
            CommandResult::Failure(failure) => error!("command {} failed: {}", index, failure),
        }
    }

    pipeline.manager().close_all().await;

    if outcome.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
