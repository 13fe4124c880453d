//! Editorial content: news, articles and videos.

use crate::cache::{CacheKey, CacheService, CachedFn, Degradable, Sourced};
use crate::config::CacheConfig;
use crate::error::PortalError;
use crate::model::{ContentItem, ContentKind, ContentPatch, ListOptions, NewContent};
use crate::services::{decode_rows, first_row, with_list_options, Backend, Query};
use std::sync::Arc;
use tracing::instrument;

pub const NAMESPACE: &str = "content";
const TABLE: &str = "content";

type ListArgs = (ContentKind, String, ListOptions);

pub struct ContentService {
    backend: Arc<dyn Backend>,
    cache: Arc<CacheService>,
    list: Degradable<ListArgs, Vec<ContentItem>>,
    by_slug: CachedFn<(ContentKind, String), ContentItem>,
}

impl ContentService {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<CacheService>, ttl: &CacheConfig) -> Self {
        let list = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |(kind, lang, opts): ListArgs| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let query = with_list_options(
                            Query::new().eq("kind", kind).eq("lang", &lang),
                            &opts,
                            "category",
                        )
                        .order("published_at", false);
                        decode_rows::<ContentItem>(backend.select(TABLE, &query).await?)
                    }
                },
                |(kind, lang, opts): &ListArgs| {
                    CacheKey::new(NAMESPACE)
                        .push("list")
                        .push(kind)
                        .push(lang)
                        .push_json(opts)
                },
                ttl.list_ttl,
            )
        };

        let by_slug = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |(kind, slug): (ContentKind, String)| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let query = Query::new().eq("kind", kind).eq("slug", &slug);
                        let rows = backend.select(TABLE, &query).await?;
                        first_row::<ContentItem>(rows, format!("{} {}", kind, slug))
                    }
                },
                |(kind, slug): &(ContentKind, String)| {
                    Ok(CacheKey::new(NAMESPACE).push("item").push(kind).push(slug))
                },
                ttl.detail_ttl,
            )
        };

        Self {
            backend,
            cache,
            list: Degradable::new(list, |(_, lang, _): &ListArgs| vec![offline_notice(lang)]),
            by_slug,
        }
    }

    pub async fn list(
        &self,
        kind: ContentKind,
        lang: &str,
        opts: ListOptions,
    ) -> Result<Arc<Vec<ContentItem>>, PortalError> {
        self.list.primary().call((kind, lang.to_string(), opts)).await
    }

    /// Listing that degrades to a single "temporarily unavailable" notice
    pub async fn list_or_offline(
        &self,
        kind: ContentKind,
        lang: &str,
        opts: ListOptions,
    ) -> Result<Sourced<Vec<ContentItem>>, PortalError> {
        self.list.call((kind, lang.to_string(), opts)).await
    }

    pub async fn get_by_slug(&self, kind: ContentKind, slug: &str) -> Result<Arc<ContentItem>, PortalError> {
        self.by_slug.call((kind, slug.to_string())).await
    }

    #[instrument(skip(self, new), fields(kind = %new.kind, slug = %new.slug))]
    pub async fn publish(&self, new: &NewContent) -> Result<ContentItem, PortalError> {
        let row = self.backend.insert(TABLE, serde_json::to_value(new)?).await?;
        let item: ContentItem = serde_json::from_value(row)?;
        self.cache.invalidate(NAMESPACE, None);
        Ok(item)
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: i64, patch: &ContentPatch) -> Result<ContentItem, PortalError> {
        let row = self
            .backend
            .update(TABLE, &id.to_string(), serde_json::to_value(patch)?)
            .await?;
        let item: ContentItem = serde_json::from_value(row)?;
        // detail keys are kind.slug, known only from the updated row
        self.cache
            .invalidate(NAMESPACE, Some(&format!("{}.{}", item.kind, item.slug)));
        Ok(item)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), PortalError> {
        self.backend.delete(TABLE, &id.to_string()).await?;
        self.cache.invalidate(NAMESPACE, None);
        Ok(())
    }
}

fn offline_notice(lang: &str) -> ContentItem {
    let (title, body) = match lang {
        "ru" => (
            "Сервис временно недоступен",
            "Материалы скоро снова появятся. Попробуйте обновить страницу позже.",
        ),
        "en" => (
            "Service temporarily unavailable",
            "Content will be back shortly. Please try again later.",
        ),
        _ => (
            "Xizmat vaqtincha mavjud emas",
            "Materiallar tez orada qaytadi. Iltimos, keyinroq qayta urinib ko'ring.",
        ),
    };
    ContentItem {
        id: 0,
        kind: ContentKind::News,
        slug: "offline".to_string(),
        lang: lang.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        published_at: None,
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
                json!({"id": 1, "kind": "news", "slug": "emlash-kampaniyasi", "lang": "uz", "title": "Emlash kampaniyasi", "published_at": "2024-02-01T09:00:00Z"}),
                json!({"id": 2, "kind": "article", "slug": "qandli-diabet", "lang": "uz", "title": "Qandli diabet haqida"}),
                json!({"id": 3, "kind": "video", "slug": "nafas-mashqlari", "lang": "uz", "title": "Nafas mashqlari"}),
            ],
        );
        backend
    }

    #[tokio::test]
    async fn test_listing_is_scoped_by_kind() {
        let backend = seeded();
        let content = ContentService::new(backend.clone(), cache(), &CacheConfig::default());

        let news = content.list(ContentKind::News, "uz", ListOptions::default()).await.unwrap();
        let videos = content.list(ContentKind::Video, "uz", ListOptions::default()).await.unwrap();
        assert_eq!(news.len(), 1);
        assert_eq!(videos[0].slug, "nafas-mashqlari");
        assert_eq!(backend.selects(), 2);
    }

    #[tokio::test]
    async fn test_update_refreshes_the_edited_item() {
        let backend = seeded();
        let content = ContentService::new(backend.clone(), cache(), &CacheConfig::default());
        content.get_by_slug(ContentKind::Article, "qandli-diabet").await.unwrap();
        content.get_by_slug(ContentKind::News, "emlash-kampaniyasi").await.unwrap();

        content
            .update(
                2,
                &ContentPatch {
                    title: Some("Qandli diabet: belgilar va davolash".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let article = content
            .get_by_slug(ContentKind::Article, "qandli-diabet")
            .await
            .unwrap();
        assert_eq!(article.title, "Qandli diabet: belgilar va davolash");
        content.get_by_slug(ContentKind::News, "emlash-kampaniyasi").await.unwrap();
        assert_eq!(backend.selects(), 3);
    }

    #[tokio::test]
    async fn test_publish_invalidates_listings() {
        let backend = seeded();
        let content = ContentService::new(backend.clone(), cache(), &CacheConfig::default());
        content.list(ContentKind::News, "uz", ListOptions::default()).await.unwrap();

        content
            .publish(&NewContent {
                kind: ContentKind::News,
                slug: "yangi-klinika".to_string(),
                lang: "uz".to_string(),
                title: "Yangi klinika ochildi".to_string(),
                body: "...".to_string(),
            })
            .await
            .unwrap();

        let news = content.list(ContentKind::News, "uz", ListOptions::default()).await.unwrap();
        assert_eq!(news.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_notice_in_requested_language() {
        let backend = seeded();
        let content = ContentService::new(backend.clone(), cache(), &CacheConfig::default());
        backend.fail_with(Some(PortalError::from_message("NetworkError when attempting to fetch resource")));

        let result = content
            .list_or_offline(ContentKind::News, "ru", ListOptions::default())
            .await
            .unwrap();
        assert!(result.is_fallback());
        assert_eq!(result.value[0].title, "Сервис временно недоступен");
    }
}
