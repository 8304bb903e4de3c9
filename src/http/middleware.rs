//! Rate limiting middleware for HTTP handlers.
//!
//! The layer resolves identity and tier, asks the [`RateLimiter`] for a
//! decision, and either short-circuits with a 429 or lets the request
//! through with informational rate limit headers on the response. It holds
//! no state of its own.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde::Serialize;
use tower::{Layer, Service};
use tracing::debug;

use crate::identity::{IdentityResolver, TierResolver};
use crate::ratelimit::{Decision, LimitClass, RateLimiter};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Write the rate limit headers for a decision.
///
/// `X-RateLimit-Reset` carries the window end as epoch seconds.
/// `Retry-After` is only written for denials.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at.timestamp()));
    if let Some(retry_after) = decision.retry_after_secs {
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

/// Quota details included in a 429 body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Window end in RFC 3339
    pub reset_time: String,
    /// Seconds until the window ends
    pub retry_after: u64,
}

/// The terminal response for a denied request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRejection {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
    pub rate_limit_info: RateLimitInfo,
    #[serde(skip)]
    decision: Decision,
}

impl RateLimitRejection {
    pub fn new(decision: Decision) -> Self {
        let retry_after = decision.retry_after_secs.unwrap_or(1);

        Self {
            success: false,
            error: "Rate limit exceeded",
            message: format!(
                "Too many requests. Please try again in {} seconds.",
                retry_after
            ),
            rate_limit_info: RateLimitInfo {
                limit: decision.limit,
                remaining: 0,
                reset_time: decision.reset_at.to_rfc3339(),
                retry_after,
            },
            decision: Decision {
                remaining: 0,
                retry_after_secs: Some(retry_after),
                ..decision
            },
        }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &self.decision);
        (StatusCode::TOO_MANY_REQUESTS, headers, Json(self)).into_response()
    }
}

/// Rate limiting layer for one limit class.
#[derive(Clone)]
pub struct RateLimitLayer {
    class: LimitClass,
    limiter: Arc<RateLimiter>,
    identity: Arc<dyn IdentityResolver>,
    tier: Arc<dyn TierResolver>,
}

impl RateLimitLayer {
    /// Create a layer counting requests of `class`.
    pub fn new(
        class: LimitClass,
        limiter: Arc<RateLimiter>,
        identity: Arc<dyn IdentityResolver>,
        tier: Arc<dyn TierResolver>,
    ) -> Self {
        Self {
            class,
            limiter,
            identity,
            tier,
        }
    }

    /// Resolve the caller and count the request.
    pub async fn decide(&self, parts: &Parts) -> Decision {
        let identifier = self.identity.resolve_identity(parts).await;
        let tier = self.tier.resolve_tier(parts, &identifier).await;
        let decision = self.limiter.check(self.class, &identifier, tier).await;

        if !decision.allowed {
            debug!(
                class = %self.class,
                identifier = %identifier,
                tier = %tier,
                path = %parts.uri.path(),
                "Rejecting rate limited request"
            );
        }
        decision
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    layer: RateLimitLayer,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let layer = self.layer.clone();
        // Keep the instance that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let decision = layer.decide(&parts).await;

            if !decision.allowed {
                return Ok(RateLimitRejection::new(decision).into_response());
            }

            let mut response = inner.call(Request::<Body>::from_parts(parts, body)).await?;
            // When layers are nested the innermost limit reports its headers
            if !response.headers().contains_key(X_RATELIMIT_LIMIT) {
                apply_headers(response.headers_mut(), &decision);
            }
            Ok(response)
        })
    }
}
