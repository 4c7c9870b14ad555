//! Runs the relay until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use wsrelay_server::RelayServer;

use crate::config::Config;

/// How long open connections get to say goodbye after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = RelayServer::new(config.server_config());

    let server_run = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut serve => {
            // The accept loop only returns on its own when binding fails.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    server.shutdown();
    serve.await??;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while !server.registry().is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        let remaining = server.registry().len().await;
        tracing::warn!(remaining, "connections still open at exit");
    }
    Ok(())
}
