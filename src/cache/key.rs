//! Deterministic cache key derivation.
//!
//! Keys are `namespace.segment.segment...`. Option objects are rendered with
//! serde_json, so two semantically equal option structs always produce the
//! same key. Callers whose options contain maps should use `BTreeMap` to keep
//! the rendering stable.

use crate::error::PortalError;
use serde::Serialize;
use std::fmt;

const SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start a key under an entity namespace (e.g. `diseases`)
    pub fn new(namespace: &str) -> Self {
        Self(namespace.to_string())
    }

    /// Append a plain segment
    pub fn push(mut self, segment: impl fmt::Display) -> Self {
        self.0.push(SEPARATOR);
        self.0.push_str(&segment.to_string());
        self
    }

    /// Append a serialized option object
    pub fn push_json<T: Serialize + ?Sized>(self, options: &T) -> Result<Self, PortalError> {
        let rendered = serde_json::to_string(options)
            .map_err(|e| PortalError::KeyGeneration(format!("{}: {}", self.0, e)))?;
        Ok(self.push(rendered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Namespace portion, used as a metrics label
    pub fn namespace(&self) -> &str {
        self.0.split(SEPARATOR).next().unwrap_or_default()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}
