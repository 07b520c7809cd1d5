use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use xrate_rs::config::{Cli, Settings};
use xrate_rs::market_data::adapters::garantex::GarantexClient;
use xrate_rs::persist::postgres::PgClient;
use xrate_rs::rates::RateModule;
use xrate_rs::server::Server;
use xrate_rs::telemetry::{init_metrics, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let cli = Cli::parse();
    let settings = Settings::load(&cli).context("load settings")?;

    init_tracing(&settings.env);
    init_metrics(settings.metrics.listen)?;
    info!(env = %settings.env, "Starting xrate");

    let store = Arc::new(PgClient::connect(&settings.postgres).await.context("connect to postgres")?);
    info!(host = %settings.postgres.host, db = %settings.postgres.db_name, "Postgres connected");

    let garantex = Arc::new(GarantexClient::from_config(&settings.garantex).context("build garantex client")?);
    let rates = Arc::new(RateModule::new(garantex, store.clone()));

    let server = Arc::new(Server::new(settings.grpc.addr(), rates).with_request_timeout(settings.grpc.request_timeout()));
    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });

    let served_early = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        res = &mut serving => Some(res),
    };

    let grace = settings.grpc.shutdown_grace();
    if let Err(e) = server.stop(grace).await {
        error!(error = %e, "gRPC server did not stop gracefully");
    }
    store.close().await;
    info!("Postgres pool closed");

    let served = match served_early {
        Some(res) => res,
        None => serving.await,
    };
    served.context("server task panicked")?.context("gRPC server failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
