use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

/// Format and default level by environment; `RUST_LOG` wins when set.
pub fn init_tracing(env: &str) {
    let (default_filter, json) = match env {
        "prod" => ("warn", true),
        "dev" => ("info", true),
        _ => ("debug", false),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(listen: Option<SocketAddr>) -> anyhow::Result<()> {
    use anyhow::Context;
    use metrics_exporter_prometheus::PrometheusBuilder;

    let Some(addr) = listen else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install prometheus exporter")?;

    tracing::info!(%addr, "Prometheus exporter listening");
    metrics::gauge!("xrate_up").set(1.0);
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(_listen: Option<SocketAddr>) -> anyhow::Result<()> {
    Ok(())
}
