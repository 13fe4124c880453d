//! medcache - read-through caching data layer for a medical information portal.
//!
//! Wraps every read against the hosted backend with a TTL cache, coalesces
//! concurrent misses into one request, invalidates by prefix after writes and
//! stops calling the backend while it is known to be unreachable.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod services;
