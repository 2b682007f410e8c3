//! The public HTTP surface: tenant-scoped REST endpoints for
//! sending email, managing sending domains, webhook subscriptions, and
//! analytics rollups. Bare paths, no `/api` or version prefix — the whole
//! surface is the product's only public contract.

mod analytics;
mod auth;
mod domains;
mod emails;
mod error;
mod webhooks;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sqlx::AnyPool;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::dns::DnsResolver;
use crate::models::{AnalyticsRepository, ApiKeyRepository, DomainRepository, EmailRepository, TenantRepository, WebhookRepository};
use crate::pipeline::Pipeline;
use crate::tenant_context::TenantContext;
use crate::webhook::WebhookFanout;

use error::ApiError;

/// Shared, cloneable handle every handler receives via `State<ApiState>`.
/// Handlers pull fields out directly (`state.pipeline`, `state.domains`,
/// ...) rather than going through per-repository `FromRef` impls: with this
/// many collaborators a single state extraction is simpler to read than a
/// dozen tiny impls, at the cost of handlers seeing fields they don't use.
#[derive(Clone)]
pub struct ApiState {
    pub(crate) pool: AnyPool,
    pub(crate) pipeline: Pipeline,
    pub(crate) tenant_context: TenantContext,
    pub(crate) tenants: TenantRepository,
    pub(crate) domains: DomainRepository,
    pub(crate) api_keys: ApiKeyRepository,
    pub(crate) emails: EmailRepository,
    pub(crate) webhooks: WebhookRepository,
    pub(crate) webhook_fanout: WebhookFanout,
    pub(crate) analytics: AnalyticsRepository,
    pub(crate) dns: DnsResolver,
    pub(crate) config: Arc<Config>,
    pub(crate) idempotency_window: chrono::Duration,
}

async fn healthy(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1").execute(&state.pool).await.map_err(crate::models::Error::from)?;
    Ok(Json(json!({ "status": "ok" })))
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(healthy))
        .route("/emails", post(emails::create).get(emails::list))
        .route("/emails/batch", post(emails::create_batch))
        .route("/emails/{id}", get(emails::get))
        .route("/domains", post(domains::create).get(domains::list))
        .route("/domains/{id}", get(domains::get).delete(domains::remove))
        .route("/domains/{id}/verify", post(domains::verify))
        .route("/domains/{id}/dns", get(domains::dns_config))
        .route("/webhooks", post(webhooks::create).get(webhooks::list))
        .route("/webhooks/{id}", axum::routing::delete(webhooks::remove))
        .route("/webhooks/{id}/test", post(webhooks::test))
        .route("/analytics/overview", get(analytics::overview))
        .layer((TraceLayer::new_for_http(), TimeoutLayer::new(std::time::Duration::from_secs(30))))
        .with_state(state)
}

/// Owns the bound listener and a shutdown handle. No frontend-serving
/// branch here — this product has no bundled SPA to ship alongside the API.
pub struct ApiServer {
    router: Router,
    socket: TcpListener,
    shutdown: oneshot::Receiver<()>,
}

impl ApiServer {
    pub async fn new(addr: SocketAddr, state: ApiState, shutdown: oneshot::Receiver<()>) -> std::io::Result<Self> {
        let socket = TcpListener::bind(addr).await?;
        Ok(ApiServer { router: router(state), socket, shutdown })
    }

    pub async fn serve(self) -> std::io::Result<()> {
        let local_addr = self.socket.local_addr()?;
        info!(%local_addr, "API server listening");
        axum::serve(self.socket, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                self.shutdown.await.ok();
            })
            .await
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<std::io::Result<()>> {
        tokio::spawn(self.serve())
    }
}
