//! HTTP surface: the rate limiting middleware and the server using it.

mod middleware;
mod server;

pub use middleware::{
    apply_headers, RateLimitInfo, RateLimitLayer, RateLimitRejection, RateLimitService,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{routes, AppState, HttpServer};
