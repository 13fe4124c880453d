//! Disease reference pages, per language.

use crate::cache::{CacheKey, CacheService, CachedFn, Degradable, Sourced};
use crate::config::CacheConfig;
use crate::error::PortalError;
use crate::model::{Disease, DiseasePatch, ListOptions, NewDisease};
use crate::services::{decode_rows, first_row, with_list_options, Backend, Query};
use std::sync::Arc;
use tracing::instrument;

pub const NAMESPACE: &str = "diseases";
const TABLE: &str = "diseases";

pub struct DiseaseService {
    backend: Arc<dyn Backend>,
    cache: Arc<CacheService>,
    list: Degradable<(String, ListOptions), Vec<Disease>>,
    detail: CachedFn<i64, Disease>,
}

impl DiseaseService {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<CacheService>, ttl: &CacheConfig) -> Self {
        let list = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |(lang, opts): (String, ListOptions)| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let query = with_list_options(Query::new().eq("lang", &lang), &opts, "category")
                            .order("name", true);
                        decode_rows::<Disease>(backend.select(TABLE, &query).await?)
                    }
                },
                |(lang, opts): &(String, ListOptions)| {
                    CacheKey::new(NAMESPACE).push("list").push(lang).push_json(opts)
                },
                ttl.list_ttl,
            )
        };

        let detail = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |id: i64| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let rows = backend.select(TABLE, &Query::new().eq("id", id)).await?;
                        first_row::<Disease>(rows, format!("disease {}", id))
                    }
                },
                |id: &i64| Ok(CacheKey::new(NAMESPACE).push("item").push(id)),
                ttl.detail_ttl,
            )
        };

        Self {
            backend,
            cache,
            // an empty catalogue renders as "nothing here yet" rather than an error page
            list: Degradable::new(list, |_: &(String, ListOptions)| Vec::new()),
            detail,
        }
    }

    pub async fn list(&self, lang: &str, opts: ListOptions) -> Result<Arc<Vec<Disease>>, PortalError> {
        self.list.primary().call((lang.to_string(), opts)).await
    }

    /// Listing that degrades to an empty catalogue while the backend is down
    pub async fn list_or_offline(
        &self,
        lang: &str,
        opts: ListOptions,
    ) -> Result<Sourced<Vec<Disease>>, PortalError> {
        self.list.call((lang.to_string(), opts)).await
    }

    pub async fn get(&self, id: i64) -> Result<Arc<Disease>, PortalError> {
        self.detail.call(id).await
    }

    #[instrument(skip(self, new), fields(slug = %new.slug))]
    pub async fn create(&self, new: &NewDisease) -> Result<Disease, PortalError> {
        let row = self.backend.insert(TABLE, serde_json::to_value(new)?).await?;
        let disease: Disease = serde_json::from_value(row)?;
        self.cache.invalidate(NAMESPACE, None);
        Ok(disease)
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: i64, patch: &DiseasePatch) -> Result<Disease, PortalError> {
        let row = self
            .backend
            .update(TABLE, &id.to_string(), serde_json::to_value(patch)?)
            .await?;
        let disease: Disease = serde_json::from_value(row)?;
        self.cache.invalidate(NAMESPACE, Some(&id.to_string()));
        Ok(disease)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), PortalError> {
        self.backend.delete(TABLE, &id.to_string()).await?;
        self.cache.invalidate(NAMESPACE, Some(&id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{cache, FakeBackend};
    use serde_json::json;
    use std::time::Duration;

    fn seeded() -> Arc<FakeBackend> {
        let backend = Arc::new(FakeBackend::new());
        backend.seed(
            TABLE,
            vec![
                json!({"id": 1, "slug": "gripp", "lang": "uz", "name": "Gripp", "category": "infeksiya"}),
                json!({"id": 2, "slug": "angina", "lang": "uz", "name": "Angina", "category": "infeksiya"}),
                json!({"id": 3, "slug": "gripp", "lang": "ru", "name": "Грипп", "category": "infeksiya"}),
            ],
        );
        backend
    }

    fn service(backend: &Arc<FakeBackend>) -> DiseaseService {
        DiseaseService::new(backend.clone(), cache(), &CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_is_cached_per_language() {
        let backend = seeded();
        let diseases = service(&backend);

        let uz = diseases.list("uz", ListOptions::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let again = diseases.list("uz", ListOptions::default()).await.unwrap();
        assert_eq!(uz.len(), 2);
        assert!(Arc::ptr_eq(&uz, &again));
        assert_eq!(backend.selects(), 1);

        let ru = diseases.list("ru", ListOptions::default()).await.unwrap();
        assert_eq!(ru[0].name, "Грипп");
        assert_eq!(backend.selects(), 2);

        // list TTL is two minutes
        tokio::time::advance(Duration::from_secs(61)).await;
        diseases.list("uz", ListOptions::default()).await.unwrap();
        assert_eq!(backend.selects(), 3);
    }

    #[tokio::test]
    async fn test_update_invalidates_item_and_listings() {
        let backend = seeded();
        let diseases = service(&backend);

        assert_eq!(diseases.get(1).await.unwrap().name, "Gripp");
        diseases.get(2).await.unwrap();
        diseases.list("uz", ListOptions::default()).await.unwrap();
        assert_eq!(backend.selects(), 3);

        let patch = DiseasePatch {
            name: Some("Gripp (A)".to_string()),
            ..Default::default()
        };
        diseases.update(1, &patch).await.unwrap();

        assert_eq!(diseases.get(1).await.unwrap().name, "Gripp (A)");
        let listed = diseases.list("uz", ListOptions::default()).await.unwrap();
        assert!(listed.iter().any(|d| d.name == "Gripp (A)"));
        // disease 2 stayed cached
        diseases.get(2).await.unwrap();
        assert_eq!(backend.selects(), 5);
    }

    #[tokio::test]
    async fn test_create_shows_up_in_next_listing() {
        let backend = seeded();
        let diseases = service(&backend);
        assert_eq!(diseases.list("uz", ListOptions::default()).await.unwrap().len(), 2);

        let created = diseases
            .create(&NewDisease {
                slug: "bronxit".to_string(),
                lang: "uz".to_string(),
                name: "Bronxit".to_string(),
                summary: None,
                symptoms: vec!["yo'tal".to_string()],
                category: Some("infeksiya".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(created.symptoms, vec!["yo'tal".to_string()]);
        assert_eq!(diseases.list("uz", ListOptions::default()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_cache() {
        let backend = seeded();
        let diseases = service(&backend);
        diseases.list("uz", ListOptions::default()).await.unwrap();

        backend.fail_with(Some(PortalError::Application {
            status: 403,
            message: "permission denied".into(),
        }));
        assert!(diseases.delete(2).await.is_err());
        backend.fail_with(None);

        diseases.list("uz", ListOptions::default()).await.unwrap();
        assert_eq!(backend.selects(), 1);
    }

    #[tokio::test]
    async fn test_missing_disease_is_not_found() {
        let backend = seeded();
        let diseases = service(&backend);
        assert!(matches!(diseases.get(99).await, Err(PortalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_offline_listing_when_backend_is_down() {
        let backend = seeded();
        let diseases = service(&backend);
        backend.fail_with(Some(PortalError::Transport("Failed to fetch".into())));

        let result = diseases
            .list_or_offline("uz", ListOptions::default())
            .await
            .unwrap();
        assert!(result.is_fallback());
        assert!(result.value.is_empty());
    }
}
