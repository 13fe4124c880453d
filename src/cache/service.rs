//! Read-through cache service.
//!
//! `CacheService` owns the TTL store, the single-flight registry and a handle
//! to the backend health breaker. Data-access modules receive it through an
//! `Arc` and wrap their raw fetches with [`CacheService::wrap`].

use crate::cache::breaker::{CircuitBreaker, HealthState};
use crate::cache::flight::{FlightRole, SingleFlight};
use crate::cache::key::CacheKey;
use crate::cache::store::TtlStore;
use crate::error::PortalError;
use crate::metrics::SharedMetrics;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Type-erased cached payload; every hit hands out the same allocation
pub type CachedValue = Arc<dyn Any + Send + Sync>;

type FlightOutput = Result<CachedValue, PortalError>;

/// Point-in-time view of the cache internals
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub health: HealthState,
}

pub struct CacheService {
    pub(crate) store: Arc<TtlStore<CachedValue>>,
    pub(crate) flights: SingleFlight<FlightOutput>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) metrics: Option<SharedMetrics>,
}

impl CacheService {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            store: Arc::new(TtlStore::new()),
            flights: SingleFlight::new(),
            breaker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Serve `key` from the store, join an in-flight fetch, or run `fetch`.
    ///
    /// Failures are never cached. When the breaker reports the backend as
    /// unhealthy a miss returns [`PortalError::BackendUnavailable`] without
    /// calling `fetch`.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<Arc<T>, PortalError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PortalError>> + Send + 'static,
    {
        let namespace = key.namespace();

        if let Some(value) = self.lookup::<T>(key) {
            debug!(cache_key = %key, "Cache HIT");
            if let Some(metrics) = &self.metrics {
                metrics.record_hit(namespace);
            }
            return Ok(value);
        }

        if !self.breaker.is_healthy() {
            debug!(cache_key = %key, "Backend unhealthy, skipping fetch");
            if let Some(metrics) = &self.metrics {
                metrics.record_skipped(namespace);
            }
            return Err(PortalError::BackendUnavailable);
        }

        let store = Arc::clone(&self.store);
        let breaker = Arc::clone(&self.breaker);
        let owned_key = key.as_str().to_string();

        let (flight, role) = self.flights.join_or_start(key.as_str(), move |ticket| {
            let pending = fetch();
            async move {
                // another flight may have filled the slot between our miss and registration
                if let Some(value) = store.get(&owned_key) {
                    if value.is::<T>() {
                        return Ok(value);
                    }
                }

                match pending.await {
                    Ok(value) => {
                        breaker.record_success();
                        let value: CachedValue = Arc::new(value);
                        if ticket.is_detached() {
                            debug!(cache_key = %owned_key, "Invalidated while in flight, not caching");
                        } else {
                            store.set(&owned_key, Arc::clone(&value), ttl);
                        }
                        Ok(value)
                    }
                    Err(err) => {
                        breaker.observe(&err);
                        Err(err)
                    }
                }
            }
        });

        match role {
            FlightRole::Leader => {
                debug!(cache_key = %key, "Cache MISS, fetching from backend");
                if let Some(metrics) = &self.metrics {
                    metrics.record_miss(namespace);
                }
            }
            FlightRole::Follower => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_coalesced(namespace);
                }
            }
        }

        let value = flight.await.map_err(|err| {
            if let Some(metrics) = &self.metrics {
                metrics.record_fetch_error(namespace, error_kind(&err));
            }
            err
        })?;

        value.downcast::<T>().map_err(|_| {
            PortalError::KeyGeneration(format!(
                "cache key {} is shared by different value types",
                key
            ))
        })
    }

    /// Build the cached counterpart of a raw fetch function
    pub fn wrap<A, T, F, Fut, K>(self: &Arc<Self>, fetch: F, key_of: K, ttl: Duration) -> CachedFn<A, T>
    where
        A: Send + 'static,
        T: Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PortalError>> + Send + 'static,
        K: Fn(&A) -> Result<CacheKey, PortalError> + Send + Sync + 'static,
    {
        debug_assert!(!ttl.is_zero(), "cache TTL must be greater than zero");
        CachedFn {
            cache: Arc::clone(self),
            fetch: Arc::new(move |args| fetch(args).boxed()),
            key_of: Arc::new(key_of),
            ttl,
        }
    }

    /// Cached value for `key`, if present, fresh and of type `T`
    pub fn peek<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.lookup(key)
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<T>> {
        let value = self.store.get(key.as_str())?;
        match value.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                warn!(cache_key = %key, "Cached value has unexpected type, treating as miss");
                None
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.breaker.is_healthy()
    }

    pub fn set_health(&self, healthy: bool) {
        self.breaker.set_health(healthy);
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn stats(&self) -> CacheStats {
        let stats = CacheStats {
            entries: self.store.len(),
            in_flight: self.flights.in_flight(),
            health: self.breaker.state(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.update_cache_metrics(&stats);
        }
        stats
    }
}

fn error_kind(err: &PortalError) -> &'static str {
    match err {
        PortalError::Transport(_) => "transport",
        PortalError::Application { .. } => "application",
        PortalError::BackendUnavailable => "unavailable",
        PortalError::KeyGeneration(_) => "key",
        PortalError::Parsing(_) => "parsing",
        PortalError::NotFound(_) => "not_found",
        PortalError::Internal(_) => "internal",
    }
}

type BoxedFetch<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, PortalError>> + Send + Sync>;
type KeyOf<A> = Arc<dyn Fn(&A) -> Result<CacheKey, PortalError> + Send + Sync>;

/// A raw fetch function bound to a key generator and TTL
pub struct CachedFn<A, T> {
    cache: Arc<CacheService>,
    fetch: BoxedFetch<A, T>,
    key_of: KeyOf<A>,
    ttl: Duration,
}

impl<A, T> CachedFn<A, T>
where
    A: Send + 'static,
    T: Send + Sync + 'static,
{
    pub async fn call(&self, args: A) -> Result<Arc<T>, PortalError> {
        // key generation errors are programming errors: surface them untouched
        let key = (self.key_of)(&args)?;
        let fetch = Arc::clone(&self.fetch);
        self.cache
            .get_or_fetch(&key, self.ttl, move || fetch(args))
            .await
    }

    pub fn key_for(&self, args: &A) -> Result<CacheKey, PortalError> {
        (self.key_of)(args)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }
}

impl<A, T> Clone for CachedFn<A, T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            fetch: Arc::clone(&self.fetch),
            key_of: Arc::clone(&self.key_of),
            ttl: self.ttl,
        }
    }
}
