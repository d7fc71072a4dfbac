use report_structuring_service::{AppConfig, create_app};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "report_structuring_service=debug,report_flow=debug,tower_http=debug".into()
    });

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(
        provider = config.provider.kind.as_str(),
        model = %config.provider.model,
        max_attempts = config.retry.max_attempts,
        concurrency = config.workers.concurrency,
        "Configuration loaded"
    );

    let (app, workers) = create_app(&config).await?;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let addr = listener.local_addr()?;
    info!("Report structuring service starting on {}", addr);
    info!("Batch upload endpoint: POST http://{}/reports/batches", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last queue sender; workers drain what is left and stop.
    match workers.await {
        Ok(summary) => info!(
            finished = summary.finished,
            skipped = summary.skipped,
            abandoned = summary.abandoned,
            "Worker pool stopped"
        ),
        Err(e) => error!(error = %e, "Worker pool panicked"),
    }

    Ok(())
}
