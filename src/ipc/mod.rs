pub mod handlers;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::HostConfig;
use crate::supervisor::Supervisor;

/// HTTP API state
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
    apps_dir: PathBuf,
    max_upload_size: usize,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, cfg: &HostConfig) -> Self {
        Self {
            supervisor,
            listen_addr: cfg.listen_addr.clone(),
            apps_dir: cfg.apps_dir.clone(),
            max_upload_size: cfg.max_upload_size,
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(Any);

        Router::new()
            .route("/api/apps", get(handlers::apps::list_apps))
            .route("/api/apps/:name", axum::routing::delete(handlers::apps::delete_app))
            .route("/api/apps/:name/start", post(handlers::apps::start_app))
            .route("/api/apps/:name/stop", post(handlers::apps::stop_app))
            .route("/api/apps/:name/logs", get(handlers::apps::app_logs))
            .route("/api/upload", post(handlers::upload::upload_module))
            .nest_service("/apps", ServeDir::new(&self.apps_dir))
            .layer(DefaultBodyLimit::max(self.max_upload_size))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("Module host listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
