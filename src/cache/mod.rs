//! Cache module for medcache.
//!
//! This module provides the read-through caching layer including:
//! - Deterministic cache keys built from a namespace and call arguments
//! - A TTL store with lazy eviction and a background janitor
//! - Single-flight coalescing of concurrent misses
//! - Backend health tracking that short-circuits fetches during outages
//! - Prefix invalidation after confirmed writes
//! - Offline fallback for read paths that must render something

pub mod breaker;
pub mod fallback;
pub mod flight;
pub mod invalidation;
pub mod janitor;
pub mod key;
pub mod service;
pub mod store;

pub use breaker::{CircuitBreaker, HealthState};
pub use fallback::{DataSource, Degradable, Sourced};
pub use flight::SingleFlight;
pub use invalidation::InvalidationTarget;
pub use janitor::spawn_janitor;
pub use key::CacheKey;
pub use service::{CacheService, CacheStats, CachedFn, CachedValue};
pub use store::TtlStore;
