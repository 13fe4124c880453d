//! Doctor directory.

use crate::cache::{CacheKey, CacheService, CachedFn};
use crate::config::CacheConfig;
use crate::error::PortalError;
use crate::model::{DoctorPatch, DoctorProfile, ListOptions};
use crate::services::{decode_rows, first_row, with_list_options, Backend, Query};
use std::sync::Arc;
use tracing::instrument;

pub const NAMESPACE: &str = "doctors";
const TABLE: &str = "doctors";

pub struct DoctorService {
    backend: Arc<dyn Backend>,
    cache: Arc<CacheService>,
    list: CachedFn<ListOptions, Vec<DoctorProfile>>,
    detail: CachedFn<String, DoctorProfile>,
}

impl DoctorService {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<CacheService>, ttl: &CacheConfig) -> Self {
        let list = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |opts: ListOptions| {
                    let backend = Arc::clone(&backend);
                    async move {
                        // category selects a specialty
                        let query = with_list_options(Query::new().eq("verified", true), &opts, "specialty")
                            .order("full_name", true);
                        decode_rows::<DoctorProfile>(backend.select(TABLE, &query).await?)
                    }
                },
                |opts: &ListOptions| CacheKey::new(NAMESPACE).push("list").push_json(opts),
                ttl.list_ttl,
            )
        };

        let detail = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |id: String| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let rows = backend.select(TABLE, &Query::new().eq("id", &id)).await?;
                        first_row::<DoctorProfile>(rows, format!("doctor {}", id))
                    }
                },
                |id: &String| Ok(CacheKey::new(NAMESPACE).push("item").push(id)),
                ttl.detail_ttl,
            )
        };

        Self {
            backend,
            cache,
            list,
            detail,
        }
    }

    /// Verified doctors only
    pub async fn list(&self, opts: ListOptions) -> Result<Arc<Vec<DoctorProfile>>, PortalError> {
        self.list.call(opts).await
    }

    pub async fn get(&self, id: &str) -> Result<Arc<DoctorProfile>, PortalError> {
        self.detail.call(id.to_string()).await
    }

    #[instrument(skip(self, patch))]
    pub async fn update_profile(&self, id: &str, patch: &DoctorPatch) -> Result<DoctorProfile, PortalError> {
        let row = self
            .backend
            .update(TABLE, id, serde_json::to_value(patch)?)
            .await?;
        let profile: DoctorProfile = serde_json::from_value(row)?;
        self.cache.invalidate(NAMESPACE, Some(id));
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{cache, FakeBackend};
    use serde_json::json;

    fn seeded() -> Arc<FakeBackend> {
        let backend = Arc::new(FakeBackend::new());
        backend.seed(
            TABLE,
            vec![
                json!({"id": "d-1", "full_name": "Dilnoza Karimova", "specialty": "kardiolog", "verified": true}),
                json!({"id": "d-2", "full_name": "Aziz Rahimov", "specialty": "nevrolog", "verified": true}),
                json!({"id": "d-3", "full_name": "Olim Tursunov", "specialty": "kardiolog", "verified": false}),
            ],
        );
        backend
    }

    #[tokio::test]
    async fn test_listing_only_shows_verified_doctors() {
        let backend = seeded();
        let doctors = DoctorService::new(backend.clone(), cache(), &CacheConfig::default());

        let cardio = doctors
            .list(ListOptions::default().in_category("kardiolog"))
            .await
            .unwrap();
        assert_eq!(cardio.len(), 1);
        assert_eq!(cardio[0].full_name, "Dilnoza Karimova");
    }

    #[tokio::test]
    async fn test_profile_update_invalidates_that_doctor() {
        let backend = seeded();
        let doctors = DoctorService::new(backend.clone(), cache(), &CacheConfig::default());
        doctors.get("d-1").await.unwrap();
        doctors.get("d-2").await.unwrap();
        doctors.list(ListOptions::default()).await.unwrap();
        assert_eq!(backend.selects(), 3);

        let updated = doctors
            .update_profile(
                "d-1",
                &DoctorPatch {
                    bio: Some("20 yillik tajriba".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.bio.as_deref(), Some("20 yillik tajriba"));

        assert_eq!(doctors.get("d-1").await.unwrap().bio, updated.bio);
        doctors.get("d-2").await.unwrap();
        doctors.list(ListOptions::default()).await.unwrap();
        assert_eq!(backend.selects(), 5);
    }

    #[tokio::test]
    async fn test_application_error_is_not_cached() {
        let backend = seeded();
        let doctors = DoctorService::new(backend.clone(), cache(), &CacheConfig::default());

        backend.fail_with(Some(PortalError::Application {
            status: 401,
            message: "JWT expired".into(),
        }));
        assert!(doctors.get("d-1").await.is_err());
        backend.fail_with(None);

        assert_eq!(doctors.get("d-1").await.unwrap().specialty, "kardiolog");
        assert_eq!(backend.selects(), 2);
    }
}
