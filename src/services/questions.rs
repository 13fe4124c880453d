//! Patient questions and doctor answers.

use crate::cache::{CacheKey, CacheService, CachedFn};
use crate::config::CacheConfig;
use crate::error::PortalError;
use crate::model::{Answer, ListOptions, NewAnswer, NewQuestion, Question};
use crate::services::{decode_rows, first_row, with_list_options, Backend, Query};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

pub const NAMESPACE: &str = "questions";
const TABLE: &str = "questions";
const ANSWERS_TABLE: &str = "answers";

pub struct QuestionService {
    backend: Arc<dyn Backend>,
    cache: Arc<CacheService>,
    list: CachedFn<ListOptions, Vec<Question>>,
    by_slug: CachedFn<String, Question>,
}

impl QuestionService {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<CacheService>, ttl: &CacheConfig) -> Self {
        let list = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |opts: ListOptions| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let query = with_list_options(Query::new(), &opts, "category")
                            .order("created_at", false);
                        decode_rows::<Question>(backend.select(TABLE, &query).await?)
                    }
                },
                |opts: &ListOptions| CacheKey::new(NAMESPACE).push("list").push_json(opts),
                ttl.list_ttl,
            )
        };

        let by_slug = {
            let backend = Arc::clone(&backend);
            cache.wrap(
                move |slug: String| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let query = Query::new().select("*,answers(*)").eq("slug", &slug);
                        let rows = backend.select(TABLE, &query).await?;
                        first_row::<Question>(rows, format!("question {}", slug))
                    }
                },
                |slug: &String| Ok(CacheKey::new(NAMESPACE).push("item").push(slug)),
                ttl.detail_ttl,
            )
        };

        Self {
            backend,
            cache,
            list,
            by_slug,
        }
    }

    pub async fn list(&self, opts: ListOptions) -> Result<Arc<Vec<Question>>, PortalError> {
        self.list.call(opts).await
    }

    /// Question page with its answers embedded
    pub async fn get_by_slug(&self, slug: &str) -> Result<Arc<Question>, PortalError> {
        self.by_slug.call(slug.to_string()).await
    }

    #[instrument(skip(self, new), fields(slug = %new.slug))]
    pub async fn ask(&self, new: &NewQuestion) -> Result<Question, PortalError> {
        let row = self.backend.insert(TABLE, serde_json::to_value(new)?).await?;
        let question: Question = serde_json::from_value(row)?;
        self.cache.invalidate(NAMESPACE, None);
        Ok(question)
    }

    /// Post a doctor's answer; the question page and listings are refreshed on next read
    #[instrument(skip(self, new))]
    pub async fn answer(&self, slug: &str, new: &NewAnswer) -> Result<Answer, PortalError> {
        let question = self.get_by_slug(slug).await?;

        let mut body = serde_json::to_value(new)?;
        body["question_id"] = json!(question.id);
        let row = self.backend.insert(ANSWERS_TABLE, body).await?;
        let answer: Answer = serde_json::from_value(row)?;

        self.cache.invalidate(NAMESPACE, Some(slug));
        Ok(answer)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), PortalError> {
        self.backend.delete(TABLE, &id.to_string()).await?;
        // detail entries are keyed by slug, so drop the whole namespace
        self.cache.invalidate(NAMESPACE, None);
        Ok(())
    }
}
