//! HTTP server exposing the rate limited call sites.
//!
//! The business handlers are placeholders for the form, API and billing
//! services; they only mark where each limit class guards a request.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::handler::Handler;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::middleware::RateLimitLayer;
use crate::error::Result;
use crate::identity::{AccountDirectory, AccountTier, ClientIp, FormOwnerTier, SessionUser, StaticDirectory};
use crate::ratelimit::{LimitClass, RateLimiter, Tier};

/// Shared state of the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub directory: Arc<StaticDirectory>,
    /// Bearer token for admin routes; admin routes are not mounted when unset
    pub admin_token: Option<String>,
}

/// Build the application router.
pub fn routes(state: AppState) -> Router {
    let directory: Arc<dyn AccountDirectory> = state.directory.clone();
    let session_user = Arc::new(SessionUser::new(directory.clone()));
    let account_tier = Arc::new(AccountTier::new(directory.clone()));

    let submissions = RateLimitLayer::new(
        LimitClass::Submission,
        state.limiter.clone(),
        Arc::new(ClientIp),
        Arc::new(FormOwnerTier::new(directory, "form_id")),
    );
    let api = RateLimitLayer::new(
        LimitClass::Api,
        state.limiter.clone(),
        session_user.clone(),
        account_tier.clone(),
    );
    let form_creation = RateLimitLayer::new(
        LimitClass::FormCreation,
        state.limiter.clone(),
        session_user,
        account_tier,
    );

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/f/{form_id}", post(submit_form.layer(submissions)))
        .route(
            "/api/forms",
            get(list_forms.layer(api.clone())).post(create_form.layer(form_creation).layer(api)),
        );

    if state.admin_token.is_some() {
        router = router
            .route("/admin/tenants/{identifier}/purge", post(purge_tenant))
            .route("/admin/tenants/{identifier}/plan", post(change_plan));
    }

    router.with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn submit_form(Path(form_id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "formId": form_id }))
}

async fn list_forms() -> Json<serde_json::Value> {
    Json(json!({ "success": true, "forms": [] }))
}

async fn create_form() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::CREATED, Json(json!({ "success": true })))
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match (&state.admin_token, presented) {
        (Some(expected), Some(presented)) if tokens_match(expected, presented) => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "Unauthorized" })),
        )
            .into_response()),
    }
}

fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

async fn purge(state: &AppState, identifier: &str) -> Response {
    match state.limiter.purge(identifier).await {
        Ok(removed) => {
            info!(identifier = %identifier, removed = removed, "Purged rate limit counters");
            Json(json!({ "success": true, "removed": removed })).into_response()
        }
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "Purge incomplete");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn purge_tenant(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize_admin(&state, &headers) {
        return rejection;
    }
    purge(&state, &identifier).await
}

#[derive(Debug, Deserialize)]
struct PlanChange {
    plan: String,
}

/// Record a plan change and start the tenant on fresh windows.
async fn change_plan(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
    Json(change): Json<PlanChange>,
) -> Response {
    if let Err(rejection) = authorize_admin(&state, &headers) {
        return rejection;
    }
    if change.plan.parse::<Tier>().is_err() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "error": format!("unknown plan: {}", change.plan) })),
        )
            .into_response();
    }

    state.directory.set_plan(&identifier, &change.plan);
    purge(&state, &identifier).await
}

/// HTTP server for the rate limited endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            routes(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
