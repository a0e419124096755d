//! Tollgate - Request Rate Limiting
//!
//! This crate decides, for every inbound HTTP request, whether the caller
//! has used up its request budget for the trailing time window. With a
//! shared Redis backend the decision is identical on every instance of a
//! horizontally scaled service; without one, each process falls back to
//! local token buckets. Backend failures never block traffic.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
