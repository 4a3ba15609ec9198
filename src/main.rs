use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use promptgate::config::GatewayConfig;
use promptgate::gateway::{self, App};
use promptgate::quota::QuotaGate;
use promptgate::server::Server;

/// Quota-gated streaming gateway for LLM completions.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON settings file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "assets/appsettings.json")]
    config: PathBuf,

    /// Address to listen on, overriding the `Listen` setting.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::load(&args.config)?;
    config.apply_process_env();
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }

    let shutdown = CancellationToken::new();
    let gate = Arc::new(QuotaGate::from_setting(config.max_requests_per_hour));
    gate.spawn_reset(config.quota_window()?, shutdown.clone());

    let app = Arc::new(App::from_config(&config, gate)?);
    tracing::info!(?app, "gateway configured");
    let pipeline = gateway::pipeline(app);

    let server = Server::bind(config.listen()).await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        signal.cancel();
    });

    server
        .run(
            move |req| {
                let pipeline = pipeline.clone();
                async move { pipeline.handle(req).await }
            },
            shutdown,
        )
        .await?;
    Ok(())
}
