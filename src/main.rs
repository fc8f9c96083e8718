use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use module_host::config::HostConfig;
use module_host::ipc::IPCServer;
use module_host::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("module_host=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!("Module host starting");

    let cfg = HostConfig::load()?;
    tracing::info!(
        "Apps in {}, dev server ports from {}",
        cfg.apps_dir.display(),
        cfg.port_base
    );

    let supervisor = Arc::new(Supervisor::new(&cfg));
    supervisor.initialize().await?;

    let server = IPCServer::new(supervisor.clone(), &cfg);
    let served = server.start(shutdown_signal()).await;

    // dev servers go down with the host, even when serving failed
    supervisor.shutdown_all().await;
    tracing::info!("Module host stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping dev servers...");
}
