#![forbid(unsafe_code)]

use std::sync::Arc;

use gpurm_engine::SimulatedBackend;
use gpurm_server::{start_server, Dispatcher, ServerConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err}");
            return Err(err.into());
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(&config, Arc::new(SimulatedBackend::new()))?);
    let handle = start_server(&config, Arc::clone(&dispatcher))?;
    tracing::info!(
        engines = handle.dispatcher().engines().len(),
        display_heads = config.display_heads,
        "gpurmd ready on {} (rendezvous: {})",
        handle.socket_path().display(),
        handle.rendezvous_name().unwrap_or("disabled"),
    );

    let ctrl_c = tokio::signal::ctrl_c();

    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }

    tracing::info!("shutdown signal received");
    handle.shutdown();
    let metrics = dispatcher.metrics().snapshot();
    tracing::info!(?metrics, "final counters");
    Ok(())
}
