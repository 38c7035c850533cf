//! Wires the receiver and both endpoints together.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chunkferry_endpoint::ChannelServer;
use chunkferry_receiver::{SessionRegistry, spawn_sweeper};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the receiver until Ctrl-C or until the HTTP endpoint fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    // -- Registry --
    let registry = Arc::new(SessionRegistry::new(config.receiver_config()));
    registry
        .purge_orphans()
        .await
        .context("removing leftovers of a previous run")?;
    let sweeper = spawn_sweeper(Arc::clone(&registry), shutdown.clone());

    // -- HTTP endpoint --
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding http endpoint to {http_addr}"))?;
    let mut http = tokio::spawn(chunkferry_endpoint::serve(
        listener,
        Arc::clone(&registry),
        shutdown.clone(),
    ));

    // -- Channel endpoint --
    let channel = ChannelServer::new(
        ([0, 0, 0, 0], config.channel_port).into(),
        Arc::clone(&registry),
    );
    let channel_run = Arc::clone(&channel);
    let channel_handle = tokio::spawn(async move {
        if let Err(e) = channel_run.run().await {
            tracing::error!("channel endpoint error: {e}");
        }
    });

    tracing::info!(
        http_port = config.http_port,
        channel_port = config.channel_port,
        "chunkferry ready"
    );

    let http_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            None
        }
        result = &mut http => Some(result),
    };

    // -- Graceful shutdown --
    shutdown.cancel();
    channel.shutdown();
    let http_result = match http_result {
        Some(result) => result,
        None => http.await,
    };
    let _ = channel_handle.await;
    let _ = sweeper.await;

    let active = registry.active_sessions().len();
    if active > 0 {
        tracing::info!(active, "unfinished sessions left on disk for the next purge");
    }

    http_result
        .context("http endpoint task panicked")?
        .context("http endpoint failed")?;
    Ok(())
}
