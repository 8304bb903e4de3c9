//! Formguard - Tiered Rate Limiting for Form Submissions
//!
//! This crate implements the rate limiting layer of a multi-tenant form
//! submission service. Quotas depend on the kind of traffic and the
//! tenant's subscription tier. Counters are shared through Redis when it is
//! reachable and kept per process when it is not.

pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod ratelimit;
