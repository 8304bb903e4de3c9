//! Identity and tier resolution for rate limiting.
//!
//! Resolvers never fail: an unresolvable request is mapped to a sentinel
//! identity and the free tier, so rate limiting is never the reason an
//! unauthenticated flow breaks.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts, RawPathParams};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::AccountConfig;
use crate::ratelimit::{Tier, UNKNOWN_IDENTIFIER};

/// User id used for requests without a valid session.
pub const ANONYMOUS_USER: &str = "anonymous";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Errors reported by an account directory.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("session lookup failed: {0}")]
    Session(String),

    #[error("plan lookup failed: {0}")]
    Plan(String),
}

/// The external auth and billing collaborator.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Look up the user id of the session attached to a request.
    ///
    /// Returns `Ok(None)` for unauthenticated requests.
    async fn session_user(&self, parts: &Parts) -> Result<Option<String>, IdentityError>;

    /// Look up the raw billing plan name of a user.
    async fn plan(&self, user_id: &str) -> Result<Option<String>, IdentityError>;

    /// Look up the user id owning a form.
    async fn form_owner(&self, form_id: &str) -> Result<Option<String>, IdentityError>;
}

/// Resolves the identifier a request is counted under.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, parts: &Parts) -> String;
}

/// Resolves the tier whose quota applies to a request.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn resolve_tier(&self, parts: &Parts, identifier: &str) -> Tier;
}

/// Resolve the client IP of a request.
///
/// Tries the first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// socket peer address. Returns [`UNKNOWN_IDENTIFIER`] when none yields a
/// valid address.
pub fn resolve_ip(parts: &Parts) -> String {
    forwarded_for(&parts.headers)
        .or_else(|| header_ip(&parts.headers, REAL_IP))
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get(FORWARDED_FOR)?.to_str().ok()?;
    // The first entry is the originating client
    value.split(',').next()?.trim().parse().ok()
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Resolve the session user and their tier in one go.
///
/// Any failure resolves to `("anonymous", Tier::Free)`.
pub async fn resolve_user_and_tier(directory: &dyn AccountDirectory, parts: &Parts) -> (String, Tier) {
    let user_id = session_user_or_anonymous(directory, parts).await;
    let tier = tier_of(directory, &user_id).await;
    (user_id, tier)
}

async fn session_user_or_anonymous(directory: &dyn AccountDirectory, parts: &Parts) -> String {
    match directory.session_user(parts).await {
        Ok(Some(user_id)) if !user_id.trim().is_empty() => user_id,
        Ok(_) => {
            trace!("No session on request, counting as anonymous");
            ANONYMOUS_USER.to_string()
        }
        Err(e) => {
            warn!(error = %e, "Session lookup failed, counting as anonymous");
            ANONYMOUS_USER.to_string()
        }
    }
}

async fn tier_of(directory: &dyn AccountDirectory, user_id: &str) -> Tier {
    if user_id == ANONYMOUS_USER {
        return Tier::Free;
    }

    match directory.plan(user_id).await {
        Ok(plan) => {
            let tier = Tier::parse_or_free(plan.as_deref());
            if let Some(raw) = plan.as_deref().filter(|raw| raw.parse::<Tier>().is_err()) {
                warn!(user_id = %user_id, plan = %raw, "Unknown plan, using free tier");
            }
            tier
        }
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Plan lookup failed, using free tier");
            Tier::Free
        }
    }
}

/// Counts requests by client IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIp;

#[async_trait]
impl IdentityResolver for ClientIp {
    async fn resolve_identity(&self, parts: &Parts) -> String {
        resolve_ip(parts)
    }
}

/// Counts requests by session user id.
#[derive(Clone)]
pub struct SessionUser {
    directory: Arc<dyn AccountDirectory>,
}

impl SessionUser {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl IdentityResolver for SessionUser {
    async fn resolve_identity(&self, parts: &Parts) -> String {
        session_user_or_anonymous(self.directory.as_ref(), parts).await
    }
}

/// Uses the billing plan of the identified user.
#[derive(Clone)]
pub struct AccountTier {
    directory: Arc<dyn AccountDirectory>,
}

impl AccountTier {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl TierResolver for AccountTier {
    async fn resolve_tier(&self, _parts: &Parts, identifier: &str) -> Tier {
        tier_of(self.directory.as_ref(), identifier).await
    }
}

/// Uses the billing plan of the user owning the form named by a path
/// parameter, so submissions to a paying tenant's form get its quota.
///
/// Requests without the parameter, forms without a known owner and failed
/// lookups are rated at the free tier.
#[derive(Clone)]
pub struct FormOwnerTier {
    directory: Arc<dyn AccountDirectory>,
    param: &'static str,
}

impl FormOwnerTier {
    /// `param` is the route parameter holding the form id, e.g. `form_id`
    /// for `/f/{form_id}`.
    pub fn new(directory: Arc<dyn AccountDirectory>, param: &'static str) -> Self {
        Self { directory, param }
    }
}

#[async_trait]
impl TierResolver for FormOwnerTier {
    async fn resolve_tier(&self, parts: &Parts, _identifier: &str) -> Tier {
        let Some(form_id) = path_param(parts, self.param).await else {
            trace!(param = self.param, "No form id on request, using free tier");
            return Tier::Free;
        };

        match self.directory.form_owner(&form_id).await {
            Ok(Some(owner)) => tier_of(self.directory.as_ref(), &owner).await,
            Ok(None) => Tier::Free,
            Err(e) => {
                warn!(form_id = %form_id, error = %e, "Form owner lookup failed, using free tier");
                Tier::Free
            }
        }
    }
}

async fn path_param(parts: &Parts, name: &str) -> Option<String> {
    let mut parts = parts.clone();
    let params = RawPathParams::from_request_parts(&mut parts, &()).await.ok()?;
    params
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Applies the same tier to every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTier(pub Tier);

#[async_trait]
impl TierResolver for FixedTier {
    async fn resolve_tier(&self, _parts: &Parts, _identifier: &str) -> Tier {
        self.0
    }
}

/// An account directory backed by a bearer-token table from configuration.
///
/// Plans can be changed at runtime, e.g. when billing reports an upgrade.
pub struct StaticDirectory {
    /// Bearer token -> user id
    sessions: HashMap<String, String>,
    /// User id -> plan name
    plans: RwLock<HashMap<String, String>>,
    /// Form id -> owning user id
    forms: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(accounts: &[AccountConfig]) -> Self {
        let sessions = accounts
            .iter()
            .map(|a| (a.token.clone(), a.user_id.clone()))
            .collect();
        let plans = accounts
            .iter()
            .map(|a| (a.user_id.clone(), a.plan.clone()))
            .collect();
        let forms = accounts
            .iter()
            .flat_map(|a| a.forms.iter().map(|form| (form.clone(), a.user_id.clone())))
            .collect();

        Self {
            sessions,
            plans: RwLock::new(plans),
            forms,
        }
    }

    /// Record a new plan for a user.
    pub fn set_plan(&self, user_id: &str, plan: &str) {
        self.plans.write().insert(user_id.to_string(), plan.to_string());
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn session_user(&self, parts: &Parts) -> Result<Option<String>, IdentityError> {
        let Some(value) = parts.headers.get(AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|e| IdentityError::Session(format!("invalid authorization header: {}", e)))?;

        Ok(value
            .strip_prefix("Bearer ")
            .and_then(|token| self.sessions.get(token.trim()))
            .cloned())
    }

    async fn plan(&self, user_id: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.plans.read().get(user_id).cloned())
    }

    async fn form_owner(&self, form_id: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.forms.get(form_id).cloned())
    }
}
