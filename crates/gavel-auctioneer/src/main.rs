use std::process::ExitCode;

use gavel_auctioneer::{
    config,
    telemetry,
    Auctioneer,
    Config,
    Metrics,
};
use tokio::{
    select,
    signal::unix::{
        signal,
        SignalKind,
    },
};
use tracing::{
    error,
    info,
    warn,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cfg: Config = match config::get() {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("failed to read configuration:\n{error:?}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = telemetry::init(std::io::stdout, &cfg.log) {
        eprintln!("failed to setup telemetry:\n{error:?}");
        return ExitCode::FAILURE;
    }

    if !cfg.no_metrics {
        if let Err(error) = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(cfg.metrics_http_listener_addr)
            .install()
        {
            error!(%error, "failed to setup the prometheus exporter");
            return ExitCode::FAILURE;
        }
    }
    let metrics = Metrics::register();

    info!(
        config = serde_json::to_string(&cfg).expect("the config always serializes to json"),
        "initializing auctioneer"
    );

    let mut auctioneer = Auctioneer::spawn(cfg, metrics);

    let mut sigterm =
        signal(SignalKind::terminate()).expect("installing a SIGTERM handler cannot fail on Unix");

    select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM; shutting down");
            if let Err(error) = auctioneer.shutdown().await {
                warn!(%error, "encountered an error while shutting down");
            }
            info!("auctioneer stopped");
            ExitCode::SUCCESS
        }

        res = &mut auctioneer => {
            error!(
                error = res.err().map(tracing::field::display),
                "auctioneer task exited unexpectedly"
            );
            ExitCode::FAILURE
        }
    }
}
