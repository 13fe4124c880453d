pub mod backend;
pub mod content;
pub mod diseases;
pub mod doctors;
pub mod questions;
pub mod users;

pub use backend::{Backend, HttpBackend, Query};

use crate::cache::CacheService;
use crate::config::CacheConfig;
use crate::error::PortalError;
use crate::model::ListOptions;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Every data-access module, sharing one backend and one cache
pub struct Portal {
    pub diseases: diseases::DiseaseService,
    pub questions: questions::QuestionService,
    pub doctors: doctors::DoctorService,
    pub content: content::ContentService,
    pub users: users::UserService,
}

impl Portal {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<CacheService>, ttl: &CacheConfig) -> Self {
        Self {
            diseases: diseases::DiseaseService::new(backend.clone(), cache.clone(), ttl),
            questions: questions::QuestionService::new(backend.clone(), cache.clone(), ttl),
            doctors: doctors::DoctorService::new(backend.clone(), cache.clone(), ttl),
            content: content::ContentService::new(backend.clone(), cache.clone(), ttl),
            users: users::UserService::new(backend, cache, ttl),
        }
    }
}

pub(crate) fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, PortalError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(PortalError::from))
        .collect()
}

/// First row of a single-entity read, or `NotFound`
pub(crate) fn first_row<T: DeserializeOwned>(
    rows: Vec<Value>,
    what: impl fmt::Display,
) -> Result<T, PortalError> {
    match rows.into_iter().next() {
        Some(row) => Ok(serde_json::from_value(row)?),
        None => Err(PortalError::NotFound(what.to_string())),
    }
}

/// Apply paging and the module's grouping column to a listing query
pub(crate) fn with_list_options(mut query: Query, opts: &ListOptions, category_column: &str) -> Query {
    if let Some(category) = &opts.category {
        query = query.eq(category_column, category);
    }
    if let Some(limit) = opts.limit {
        query = query.limit(limit);
    }
    if let Some(offset) = opts.offset {
        query = query.offset(offset);
    }
    query
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_list_options() {
        let query = with_list_options(
            Query::new().eq("lang", "uz"),
            &ListOptions::page(10, 20).in_category("nevrologiya"),
            "category",
        );
        assert_eq!(query.eq_value("category"), Some("nevrologiya"));
        assert!(query.to_params().contains(&("limit".to_string(), "10".to_string())));
    }

    #[test]
    fn test_first_row_not_found() {
        let err = first_row::<Value>(Vec::new(), "disease 9").unwrap_err();
        assert_eq!(err, PortalError::NotFound("disease 9".into()));
        let row: Value = first_row(vec![json!({"id": 1})], "disease 1").unwrap();
        assert_eq!(row["id"], 1);
    }
}
