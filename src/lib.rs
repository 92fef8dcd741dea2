//! Cached, concurrency-bounded query orchestration for GA4 properties and
//! Search Console domains.
//!
//! A request names many targets; [`application::query::QueryService`]
//! validates them, fans the per-target fetch out under a concurrency limit,
//! memoises each fetch in a disk-backed TTL cache and assembles one
//! aggregated or grouped response with per-target failure detail.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
