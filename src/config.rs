use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Volatile listings: 2 minutes
const DEFAULT_LIST_TTL_MS: u64 = 2 * 60 * 1000;
/// Single-item detail views: 5 minutes
const DEFAULT_DETAIL_TTL_MS: u64 = 5 * 60 * 1000;
/// Session / user identity: 10 minutes
const DEFAULT_SESSION_TTL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_HEALTH_COOLDOWN_MS: u64 = 30 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10 * 1000;
const DEFAULT_BACKEND_MAX_RETRIES: u32 = 2;
const MAX_BACKEND_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub list_ttl: Duration,
    pub detail_ttl: Duration,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    /// Enable debug logging for backend requests (set via CLI)
    pub debug_requests: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("BACKEND_URL").context("BACKEND_URL is required")?;

        Ok(Self {
            backend: BackendConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: env::var("BACKEND_API_KEY").ok().filter(|k| !k.is_empty()),
                timeout: Duration::from_millis(env_u64(
                    "BACKEND_TIMEOUT_MS",
                    DEFAULT_BACKEND_TIMEOUT_MS,
                )?),
                max_retries: retries_from_env("BACKEND_MAX_RETRIES", DEFAULT_BACKEND_MAX_RETRIES)?,
            },
            cache: CacheConfig {
                list_ttl: ttl_from_env("CACHE_LIST_TTL_MS", DEFAULT_LIST_TTL_MS)?,
                detail_ttl: ttl_from_env("CACHE_DETAIL_TTL_MS", DEFAULT_DETAIL_TTL_MS)?,
                session_ttl: ttl_from_env("CACHE_SESSION_TTL_MS", DEFAULT_SESSION_TTL_MS)?,
                sweep_interval: ttl_from_env("CACHE_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)?,
            },
            health: HealthConfig {
                cooldown: Duration::from_millis(env_u64(
                    "HEALTH_COOLDOWN_MS",
                    DEFAULT_HEALTH_COOLDOWN_MS,
                )?),
            },
            debug_requests: false, // Set by CLI args in main.rs
        })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            list_ttl: Duration::from_millis(DEFAULT_LIST_TTL_MS),
            detail_ttl: Duration::from_millis(DEFAULT_DETAIL_TTL_MS),
            session_ttl: Duration::from_millis(DEFAULT_SESSION_TTL_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(DEFAULT_HEALTH_COOLDOWN_MS),
        }
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be an integer, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn ttl_from_env(name: &str, default: u64) -> Result<Duration> {
    let ms = env_u64(name, default)?;
    if ms == 0 {
        bail!("{} must be greater than zero", name);
    }
    Ok(Duration::from_millis(ms))
}

fn retries_from_env(name: &str, default: u32) -> Result<u32> {
    let raw = env_u64(name, u64::from(default))?;
    match u32::try_from(raw) {
        Ok(retries) if retries <= MAX_BACKEND_RETRIES => Ok(retries),
        _ => bail!("{} must be at most {}, got {}", name, MAX_BACKEND_RETRIES, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_ttl_policy() {
        let cache = CacheConfig::default();
        assert!(cache.list_ttl < cache.detail_ttl);
        assert!(cache.detail_ttl <= cache.session_ttl);
        assert_eq!(cache.session_ttl, Duration::from_secs(600));
        assert_eq!(HealthConfig::default().cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        env::set_var("MEDCACHE_TEST_ZERO_TTL", "0");
        assert!(ttl_from_env("MEDCACHE_TEST_ZERO_TTL", 1000).is_err());
        env::remove_var("MEDCACHE_TEST_ZERO_TTL");
    }

    #[test]
    fn test_unparsable_value_is_an_error() {
        env::set_var("MEDCACHE_TEST_BAD_INT", "five minutes");
        assert!(env_u64("MEDCACHE_TEST_BAD_INT", 1).is_err());
        env::remove_var("MEDCACHE_TEST_BAD_INT");
        assert_eq!(env_u64("MEDCACHE_TEST_UNSET", 7).unwrap(), 7);
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        env::set_var("MEDCACHE_TEST_RETRIES_OK", "4");
        assert_eq!(retries_from_env("MEDCACHE_TEST_RETRIES_OK", 2).unwrap(), 4);
        env::remove_var("MEDCACHE_TEST_RETRIES_OK");

        env::set_var("MEDCACHE_TEST_RETRIES_HIGH", "64");
        assert!(retries_from_env("MEDCACHE_TEST_RETRIES_HIGH", 2).is_err());
        env::set_var("MEDCACHE_TEST_RETRIES_HIGH", "4294967297");
        assert!(retries_from_env("MEDCACHE_TEST_RETRIES_HIGH", 2).is_err());
        env::remove_var("MEDCACHE_TEST_RETRIES_HIGH");

        assert_eq!(retries_from_env("MEDCACHE_TEST_RETRIES_UNSET", 2).unwrap(), 2);
    }
}
