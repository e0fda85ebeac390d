//! HTTP surface: invalidation webhooks, query proxy and health check.

pub mod error;
mod health;
pub mod middleware;
mod queries;
mod webhook;

pub use webhook::{EventAttributes, EventEntity, InvalidationEvent, InvalidationResponse};

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::application::invalidation::InvalidationService;
use crate::application::query::QueryService;
use crate::application::repos::AssociationsRepo;
use crate::infra::error::InfraError;

#[derive(Clone)]
pub struct HttpState {
    pub invalidation: Arc<InvalidationService>,
    pub queries: Arc<QueryService>,
    pub associations: Arc<dyn AssociationsRepo>,
    pub webhook_token: Arc<str>,
}

pub fn build_router(state: HttpState) -> Router {
    let protected = Router::new()
        .route(
            "/api/invalidate-cache-tags",
            post(webhook::invalidate_cache_tags),
        )
        .route("/api/invalidate-all", post(webhook::invalidate_all))
        .route("/api/queries", post(queries::execute_queries))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::webhook_auth,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .merge(protected)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

/// Serve until ctrl-c, then drain in-flight requests for at most `grace`.
pub async fn serve(addr: SocketAddr, router: Router, grace: Duration) -> Result<(), InfraError> {
    let listener = TcpListener::bind(addr).await?;
    info!(target = "tagsweep::http", addr = %addr, "listening");

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown({
        let stop = Arc::clone(&stop);
        async move { stop.notified().await }
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => return flatten(joined),
        _ = tokio::signal::ctrl_c() => {
            info!(target = "tagsweep::http", "shutdown signal received");
        }
    }

    stop.notify_one();
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            warn!(
                target = "tagsweep::http",
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out"
            );
            Ok(())
        }
    }
}

fn flatten(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<(), InfraError> {
    match joined {
        Ok(result) => result.map_err(InfraError::from),
        Err(err) => Err(InfraError::Io(std::io::Error::other(err))),
    }
}
