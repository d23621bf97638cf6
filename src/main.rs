//! Kapellmeister agent binary.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use kapellmeister::{
    agent::{Agent, PassOutcome, shutdown_signal},
    cli::{Cli, Command, render_plan},
    config::{Config, LogFormat},
    management::ManagementClient,
    runtime::DockerRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        agent = %config.agent.name,
        "Starting Kapellmeister agent"
    );

    let runtime = DockerRuntime::connect(config.agent.runtime_timeout).await?;
    let source = ManagementClient::new(&config.management)?;
    tracing::info!(url = %source.url(), "Desired state source configured");

    let agent = Agent::new(config.agent.clone(), Arc::new(source), Arc::new(runtime));

    match cli.selected() {
        Command::Run => {
            agent.run(shutdown_signal()?).await;
        }
        Command::Once => match agent.run_pass().await? {
            PassOutcome::Skipped => println!("Pass skipped: no desired state available."),
            PassOutcome::Completed(report) => {
                println!("{} applied, {} failed", report.applied, report.failed);
                if report.failed > 0 {
                    anyhow::bail!("{} action(s) failed", report.failed);
                }
            }
        },
        Command::Plan => match agent.plan().await? {
            None => println!("Pass would be skipped: no desired state available."),
            Some(decision) => print!("{}", render_plan(&decision)),
        },
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kapellmeister=info"));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
    }
}
