//! HTTP surface over the orchestrator.

pub mod api;
pub mod rate_limit;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::Settings;
use crate::execution::{ExecutionStore, ProjectLocks};
use crate::orchestrator::Orchestrator;
use crate::publish::Publisher;
use crate::runner::build_runner;
use crate::tracker::build_tracker;

pub use api::{AppState, SharedState, api_router};
pub use rate_limit::RateLimiter;

impl AppState {
    /// Wire the orchestrator and publisher from settings. Both share one
    /// set of project locks.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let runner = build_runner(&settings)?;
        let tracker = build_tracker(&settings.tracker);
        let locks = ProjectLocks::new();
        let orchestrator = Orchestrator::new(
            ExecutionStore::new(settings.orchestrator.max_retained),
            locks.clone(),
            runner,
            tracker,
        );
        Ok(Self {
            orchestrator,
            publisher: Publisher::new(locks),
            work_limiter: RateLimiter::per_minute(settings.server.work_rate_limit_per_minute),
            settings: Arc::new(settings),
        })
    }
}

pub fn build_router(state: SharedState) -> Router {
    api_router()
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = build_router(Arc::new(state));

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "beadwork server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_from_default_settings() {
        let mut settings = Settings::default();
        settings.tracker.kind = crate::config::TrackerKind::None;
        let state = AppState::from_settings(settings).unwrap();
        let app = build_router(Arc::new(state));

        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
