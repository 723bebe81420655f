use std::process::ExitCode;

use relay_core::RelayConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Worker failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), api::InitError> {
    let config = RelayConfig::from_env()?;
    tracing::info!(
        "Connecting to {} (exchange {}, queue {})",
        config.amqp_url_redacted(),
        config.exchange,
        config.task_queue
    );

    let broker = api::connect(&config).await?;
    let pool = api::init_workers(broker, &config, api::demo_handlers()).await?;

    let mut events = pool.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("{}", event.description()),
                Err(RecvError::Lagged(n)) => tracing::debug!("Skipped {} pool events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, draining workers...");
    pool.shutdown().await?;
    reporter.abort();
    Ok(())
}
