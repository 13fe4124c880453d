//! Offline fallback for read paths that must render something.
//!
//! A [`Degradable`] wraps a cached fetch together with a static payload. When
//! the backend is unreachable or the breaker has already given up on it, the
//! static payload is returned instead of an error. Application errors still
//! propagate: a rejected query is not an outage.

use crate::cache::service::CachedFn;
use crate::error::PortalError;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Live,
    Fallback,
}

/// A value tagged with where it came from
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    pub value: Arc<T>,
    pub source: DataSource,
}

impl<T> Sourced<T> {
    pub fn is_fallback(&self) -> bool {
        self.source == DataSource::Fallback
    }
}

type FallbackFn<A, T> = Arc<dyn Fn(&A) -> T + Send + Sync>;

pub struct Degradable<A, T> {
    primary: CachedFn<A, T>,
    fallback: FallbackFn<A, T>,
}

impl<A, T> Degradable<A, T>
where
    A: Send + 'static,
    T: Send + Sync + 'static,
{
    pub fn new<F>(primary: CachedFn<A, T>, fallback: F) -> Self
    where
        F: Fn(&A) -> T + Send + Sync + 'static,
    {
        Self {
            primary,
            fallback: Arc::new(fallback),
        }
    }

    /// Live value, or the offline payload when the backend cannot be reached
    pub async fn call(&self, args: A) -> Result<Sourced<T>, PortalError>
    where
        A: Clone,
    {
        match self.primary.call(args.clone()).await {
            Ok(value) => Ok(Sourced {
                value,
                source: DataSource::Live,
            }),
            Err(err) if err.is_unreachable() => {
                warn!(error = %err, "Backend unreachable, serving offline data");
                Ok(Sourced {
                    value: Arc::new((self.fallback)(&args)),
                    source: DataSource::Fallback,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn primary(&self) -> &CachedFn<A, T> {
        &self.primary
    }
}

impl<A, T> Clone for Degradable<A, T> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            fallback: Arc::clone(&self.fallback),
        }
    }
}
