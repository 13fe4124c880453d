//! Signed-in user identity and profile.

use crate::cache::{CacheKey, CacheService, CachedFn};
use crate::config::CacheConfig;
use crate::error::PortalError;
use crate::model::{ProfilePatch, UserProfile};
use crate::services::{Backend, Query};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{instrument, warn};

pub const NAMESPACE: &str = "users";
const PROFILES_TABLE: &str = "profiles";

pub struct UserService {
    backend: Arc<dyn Backend>,
    cache: Arc<CacheService>,
    current: CachedFn<String, UserProfile>,
}

impl UserService {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<CacheService>, ttl: &CacheConfig) -> Self {
        let current = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |token: String| {
                    let backend = Arc::clone(&backend);
                    async move { load_profile(backend.as_ref(), &token).await }
                },
                |token: &String| Ok(session_key(token)),
                ttl.session_ttl,
            )
        };

        Self {
            backend,
            cache,
            current,
        }
    }

    /// Profile of the user owning `access_token`
    pub async fn current(&self, access_token: &str) -> Result<Arc<UserProfile>, PortalError> {
        self.current.call(access_token.to_string()).await
    }

    #[instrument(skip(self, patch))]
    pub async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> Result<(), PortalError> {
        self.backend
            .update(PROFILES_TABLE, user_id, serde_json::to_value(patch)?)
            .await?;
        // sessions are keyed by token, so every cached identity goes
        self.cache.invalidate(NAMESPACE, None);
        Ok(())
    }

    /// End the session; the cached identity is dropped even if the backend call fails
    #[instrument(skip(self, access_token))]
    pub async fn sign_out(&self, access_token: &str) -> Result<(), PortalError> {
        let result = self.backend.sign_out(access_token).await;
        if let Err(err) = &result {
            warn!(error = %err, "Sign-out request failed, clearing local session anyway");
        }
        self.cache.invalidate(session_key(access_token).as_str(), None);
        result
    }
}

/// Cache key for a session; the raw token never appears in keys or logs
fn session_key(access_token: &str) -> CacheKey {
    let digest = Sha256::digest(access_token.as_bytes());
    CacheKey::new(NAMESPACE)
        .push("session")
        .push(&hex::encode(digest)[..16])
}

async fn load_profile(backend: &dyn Backend, access_token: &str) -> Result<UserProfile, PortalError> {
    let user = backend.current_user(access_token).await?;
    let id = user
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| PortalError::Parsing("session user has no id".into()))?
        .to_string();
    let email = user
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string);

    let rows = backend
        .select(PROFILES_TABLE, &Query::new().eq("id", &id))
        .await?;
    match rows.into_iter().next() {
        Some(row) => {
            let mut profile: UserProfile = serde_json::from_value(row)?;
            if profile.email.is_none() {
                profile.email = email;
            }
            Ok(profile)
        }
        // signed up but never completed the profile form
        None => Ok(UserProfile {
            id,
            email,
            full_name: None,
            phone: None,
            role: "patient".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{cache, FakeBackend};
    use serde_json::json;
    use std::time::Duration;

    const TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.session";

    fn seeded() -> Arc<FakeBackend> {
        let backend = Arc::new(FakeBackend::new());
        backend.seed_session(TOKEN, json!({"id": "u-1", "email": "malika@example.uz"}));
        backend.seed(
            PROFILES_TABLE,
            vec![json!({"id": "u-1", "full_name": "Malika Yusupova", "role": "patient"})],
        );
        backend
    }

    #[test]
    fn test_session_key_hides_token() {
        let key = session_key(TOKEN);
        assert!(key.starts_with("users.session."));
        assert!(!key.as_str().contains("eyJ"));
        assert_eq!(key, session_key(TOKEN));
        assert_ne!(key, session_key("another-token"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_user_uses_session_ttl() {
        let backend = seeded();
        let users = UserService::new(backend.clone(), cache(), &CacheConfig::default());

        let me = users.current(TOKEN).await.unwrap();
        assert_eq!(me.full_name.as_deref(), Some("Malika Yusupova"));
        assert_eq!(me.email.as_deref(), Some("malika@example.uz"));
        // identity lookup plus profile row
        assert_eq!(backend.selects(), 2);

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        users.current(TOKEN).await.unwrap();
        assert_eq!(backend.selects(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        users.current(TOKEN).await.unwrap();
        assert_eq!(backend.selects(), 4);
    }

    #[tokio::test]
    async fn test_profile_update_is_visible_immediately() {
        let backend = seeded();
        let users = UserService::new(backend.clone(), cache(), &CacheConfig::default());
        users.current(TOKEN).await.unwrap();

        users
            .update_profile(
                "u-1",
                &ProfilePatch {
                    phone: Some("+998901234567".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let me = users.current(TOKEN).await.unwrap();
        assert_eq!(me.phone.as_deref(), Some("+998901234567"));
    }

    #[tokio::test]
    async fn test_sign_out_drops_cached_identity() {
        let backend = seeded();
        let users = UserService::new(backend.clone(), cache(), &CacheConfig::default());
        users.current(TOKEN).await.unwrap();

        users.sign_out(TOKEN).await.unwrap();
        let err = users.current(TOKEN).await.unwrap_err();
        assert!(matches!(err, PortalError::Application { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_missing_profile_row_falls_back_to_identity() {
        let backend = Arc::new(FakeBackend::new());
        backend.seed_session(TOKEN, json!({"id": "u-9", "email": "new@example.uz"}));
        let users = UserService::new(backend.clone(), cache(), &CacheConfig::default());

        let me = users.current(TOKEN).await.unwrap();
        assert_eq!(me.id, "u-9");
        assert_eq!(me.role, "patient");
    }
}
