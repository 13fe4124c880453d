use crate::cache::CircuitBreaker;
use crate::config::BackendConfig;
use crate::error::PortalError;
use crate::metrics::SharedMetrics;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 10 * 1000;

/// Row filter for a table read.
///
/// Filters are kept sorted by column so two equal queries always render the
/// same parameter string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    columns: Option<String>,
    filters: BTreeMap<String, String>,
    order: Option<(String, bool)>,
    limit: Option<u32>,
    offset: Option<u32>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns to return, including embedded relations (`*,answers(*)`)
    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .insert(column.into(), format!("eq.{}", value.to_string()));
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Value the query requires for `column`, if filtered by equality
    pub fn eq_value(&self, column: &str) -> Option<&str> {
        self.filters.get(column).and_then(|f| f.strip_prefix("eq."))
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        params.extend(self.filters.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some((column, ascending)) = &self.order {
            let dir = if *ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", column, dir)));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        params
    }
}

/// Hosted backend operations used by the data-access modules
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, PortalError>;

    /// Insert one row and return it as stored
    async fn insert(&self, table: &str, body: Value) -> Result<Value, PortalError>;

    async fn update(&self, table: &str, id: &str, body: Value) -> Result<Value, PortalError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), PortalError>;

    /// Identity behind a session access token
    async fn current_user(&self, access_token: &str) -> Result<Value, PortalError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), PortalError>;
}

/// PostgREST-style HTTP client for the hosted backend
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<SharedMetrics>,
}

struct Call<'a> {
    method: Method,
    path: String,
    params: Vec<(String, String)>,
    body: Option<&'a Value>,
    bearer: Option<&'a str>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client: Client::builder()
                .timeout(config.timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            breaker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn table_path(table: &str) -> String {
        format!("/rest/v1/{}", urlencoding::encode(table))
    }

    /// Execute a request with exponential backoff and jitter.
    ///
    /// Server errors and transport failures are retried, client errors are
    /// returned immediately. The final outcome is reported to the breaker.
    async fn execute(&self, call: Call<'_>) -> Result<Option<Value>, PortalError> {
        if !self.breaker.is_healthy() {
            debug!(path = %call.path, "Backend unhealthy, not sending request");
            return Err(PortalError::BackendUnavailable);
        }

        let result = self.execute_with_retry(&call).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) => self.breaker.observe(err),
        }
        result
    }

    async fn execute_with_retry(&self, call: &Call<'_>) -> Result<Option<Value>, PortalError> {
        let url = format!("{}{}", self.base_url, call.path);
        let method_label = call.method.as_str();
        let attempts = self.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            let start = Instant::now();

            debug!(
                method = method_label,
                attempt = attempt + 1,
                url = %url,
                "Sending request to backend"
            );

            let mut request = self
                .client
                .request(call.method.clone(), &url)
                .query(&call.params);
            if let Some(key) = &self.api_key {
                request = request.header("apikey", key);
            }
            if let Some(token) = call.bearer.or(self.api_key.as_deref()) {
                request = request.bearer_auth(token);
            }
            if let Some(body) = call.body {
                request = request
                    .header("Prefer", "return=representation")
                    .json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let elapsed = start.elapsed();
                    self.record(method_label, status.as_str(), elapsed);

                    if status.is_success() {
                        debug!(
                            method = method_label,
                            status = %status,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Request successful"
                        );
                        if status == StatusCode::NO_CONTENT {
                            return Ok(None);
                        }
                        let text = resp.text().await.map_err(PortalError::from)?;
                        trace!(
                            method = method_label,
                            response_bytes = text.len(),
                            "Response body received"
                        );
                        if text.trim().is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(serde_json::from_str(&text)?));
                    }

                    let message = error_message(resp.text().await.unwrap_or_default(), status);
                    let err = PortalError::Application {
                        status: status.as_u16(),
                        message,
                    };
                    if status.is_server_error() {
                        debug!(
                            method = method_label,
                            status = %status,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Server error, will retry"
                        );
                        last_error = Some(err);
                    } else {
                        debug!(
                            method = method_label,
                            status = %status,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Client error, not retrying"
                        );
                        return Err(err);
                    }
                }
                Err(e) => {
                    let elapsed = start.elapsed();
                    self.record(method_label, "error", elapsed);
                    debug!(
                        method = method_label,
                        error = %e,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Request failed"
                    );
                    let err = PortalError::from(e);
                    if !err.is_transport() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }

            if attempt + 1 < attempts {
                let backoff = backoff_with_jitter(attempt);
                warn!(
                    method = method_label,
                    attempt = attempt + 1,
                    max_retries = self.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Request failed, retrying"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_backend_retry(method_label);
                }
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| PortalError::Transport("Request failed after retries".into())))
    }

    fn record(&self, method: &str, status: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_request(method, status, elapsed.as_secs_f64());
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    #[instrument(skip(self, query), fields(op = "select"))]
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, PortalError> {
        let body = self
            .execute(Call {
                method: Method::GET,
                path: Self::table_path(table),
                params: query.to_params(),
                body: None,
                bearer: None,
            })
            .await?;

        match body {
            Some(Value::Array(rows)) => Ok(rows),
            Some(other) => Err(PortalError::Parsing(format!(
                "expected an array of rows from {}, got {}",
                table,
                value_kind(&other)
            ))),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self, body), fields(op = "insert"))]
    async fn insert(&self, table: &str, body: Value) -> Result<Value, PortalError> {
        let returned = self
            .execute(Call {
                method: Method::POST,
                path: Self::table_path(table),
                params: Vec::new(),
                body: Some(&body),
                bearer: None,
            })
            .await?;
        single_row(returned, table)
    }

    #[instrument(skip(self, body), fields(op = "update"))]
    async fn update(&self, table: &str, id: &str, body: Value) -> Result<Value, PortalError> {
        let returned = self
            .execute(Call {
                method: Method::PATCH,
                path: Self::table_path(table),
                params: id_filter(id),
                body: Some(&body),
                bearer: None,
            })
            .await?;
        single_row(returned, table)
    }

    #[instrument(skip(self), fields(op = "delete"))]
    async fn delete(&self, table: &str, id: &str) -> Result<(), PortalError> {
        self.execute(Call {
            method: Method::DELETE,
            path: Self::table_path(table),
            params: id_filter(id),
            body: None,
            bearer: None,
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self, access_token), fields(op = "current_user"))]
    async fn current_user(&self, access_token: &str) -> Result<Value, PortalError> {
        self.execute(Call {
            method: Method::GET,
            path: "/auth/v1/user".to_string(),
            params: Vec::new(),
            body: None,
            bearer: Some(access_token),
        })
        .await?
        .ok_or_else(|| PortalError::NotFound("session user".into()))
    }

    #[instrument(skip(self, access_token), fields(op = "sign_out"))]
    async fn sign_out(&self, access_token: &str) -> Result<(), PortalError> {
        self.execute(Call {
            method: Method::POST,
            path: "/auth/v1/logout".to_string(),
            params: Vec::new(),
            body: None,
            bearer: Some(access_token),
        })
        .await?;
        Ok(())
    }
}

fn id_filter(id: &str) -> Vec<(String, String)> {
    vec![("id".to_string(), format!("eq.{}", id))]
}

/// Exponential delay for `attempt`, capped at `MAX_BACKOFF_MS` before jitter
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF_MS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Pull the human-readable message out of a backend error body
fn error_message(body: String, status: StatusCode) -> String {
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("msg"))
                .or_else(|| v.get("error_description"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body
            }
        })
}

/// Mutations return the affected rows as an array
fn single_row(value: Option<Value>, table: &str) -> Result<Value, PortalError> {
    match value {
        Some(Value::Array(mut rows)) if !rows.is_empty() => Ok(rows.swap_remove(0)),
        Some(Value::Array(_)) | None => Err(PortalError::NotFound(format!(
            "no {} row affected",
            table
        ))),
        Some(row) => Ok(row),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
