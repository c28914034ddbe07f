//! # cachegate - API Caching and Failover Proxy
//!
//! Authenticates tenants, rate-limits their requests, caches upstream
//! responses, and fails over across sources behind a circuit breaker.
//!
//! ## Architecture
//!
//! - `api`: HTTP surface — proxy front door, data API, management endpoints,
//!   middleware, shared state, response envelope
//! - `source`: upstream source registry, credential envelope encryption
//! - `pool`: shared storage pools sources can opt into
//! - `key`: cache key derivation
//! - `cache`: cache entry storage, list/filter, invalidation, purge
//! - `policy`: TTL ceilings, kill switches, no-cache rules
//! - `compliance`: region, PII, and TOS gating
//! - `mock`: mock response catalog and fallback matching
//! - `breaker`: per-source circuit breaker
//! - `distributed`: Redis-backed (or in-process fallback) windows and locks
//! - `ratelimit`: fixed-window rate limiting
//! - `dispatcher`: request dispatch, source selection, upstream calls
//! - `revalidator`: stale-while-revalidate background sweep
//! - `purger`: scheduled cache purge
//! - `lineage`: append-only cache and audit event log
//! - `tenant`: tenant identity, API keys, roles
//! - `config`, `db`: process settings and the relational store connection

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod breaker;
pub mod cache;
pub mod compliance;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod distributed;
pub mod key;
pub mod lineage;
pub mod mock;
pub mod policy;
pub mod pool;
pub mod purger;
pub mod ratelimit;
pub mod revalidator;
pub mod source;
pub mod tenant;

/// Crate version, as reported by Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as reported by Cargo.
pub const NAME: &str = env!("CARGO_PKG_NAME");
