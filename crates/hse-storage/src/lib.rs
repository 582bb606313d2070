//! Tabular sink adapters: PostgREST over HTTP and an in-process store.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "hse-storage";

/// A row as exchanged with the sink: column name to JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from table {table}: {body}")]
    HttpStatus {
        status: u16,
        table: String,
        body: String,
    },
    #[error("decoding response from table {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("row from table {table} has no integer id")]
    MissingId { table: String },
    #[error("table {table} returned no row for {operation}")]
    EmptyResponse {
        table: String,
        operation: &'static str,
    },
}

impl SinkError {
    /// Whether the same request might succeed later. Nothing retries; the
    /// flag only tells the operator a rerun is worth trying.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            SinkError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Request/response access to a remote table store.
///
/// Every call completes (or fails) before the caller issues the next one.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Rows whose columns equal every `(column, value)` pair in `filter`.
    async fn find(&self, table: &str, filter: &[(&str, JsonValue)]) -> Result<Vec<Row>, SinkError>;

    /// Insert `row` and return it as stored, including the assigned `id`.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, SinkError>;

    /// Overwrite `fields` on the row with primary key `id`.
    async fn update(&self, table: &str, id: i64, fields: Row) -> Result<(), SinkError>;

    /// Insert `row`, or merge it into the existing row that shares the
    /// `on_conflict` columns. Requires a uniqueness constraint on those columns.
    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> Result<Row, SinkError>;
}

pub fn row_id(table: &str, row: &Row) -> Result<i64, SinkError> {
    row.get("id")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| SinkError::MissingId {
            table: table.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl RestClientConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// PostgREST client (`/rest/v1/<table>`), authenticated with a service key.
#[derive(Debug)]
pub struct RestSink {
    client: reqwest::Client,
    rest_root: String,
}

impl RestSink {
    pub fn new(config: RestClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key).context("api key is not a valid header value")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("api key is not a valid bearer token")?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            rest_root: rest_root(&config.endpoint),
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_root, table)
    }

    async fn read_rows(
        &self,
        table: &str,
        resp: reqwest::Response,
    ) -> Result<Vec<Row>, SinkError> {
        let body = self.read_success(table, resp).await?;
        serde_json::from_slice(&body).map_err(|source| SinkError::Decode {
            table: table.to_string(),
            source,
        })
    }

    async fn read_success(
        &self,
        table: &str,
        resp: reqwest::Response,
    ) -> Result<Vec<u8>, SinkError> {
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        if status.is_success() {
            return Ok(body);
        }
        Err(SinkError::HttpStatus {
            status: status.as_u16(),
            table: table.to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn single_row(
        &self,
        table: &str,
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<Row, SinkError> {
        self.read_rows(table, resp)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SinkError::EmptyResponse {
                table: table.to_string(),
                operation,
            })
    }
}

#[async_trait]
impl TableSink for RestSink {
    async fn find(&self, table: &str, filter: &[(&str, JsonValue)]) -> Result<Vec<Row>, SinkError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(
            filter
                .iter()
                .map(|(column, value)| (column.to_string(), filter_param(value))),
        );
        debug!(table, filters = filter.len(), "rest find");

        let resp = self
            .client
            .get(self.table_url(table))
            .query(&params)
            .send()
            .await?;
        self.read_rows(table, resp).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, SinkError> {
        debug!(table, "rest insert");
        let resp = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&[row])
            .send()
            .await?;
        self.single_row(table, "insert", resp).await
    }

    async fn update(&self, table: &str, id: i64, fields: Row) -> Result<(), SinkError> {
        debug!(table, id, "rest update");
        let resp = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&fields)
            .send()
            .await?;
        self.read_success(table, resp).await.map(|_| ())
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> Result<Row, SinkError> {
        debug!(table, on_conflict = %on_conflict.join(","), "rest upsert");
        let resp = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict.join(","))])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&[row])
            .send()
            .await?;
        self.single_row(table, "upsert", resp).await
    }
}

fn rest_root(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with("/rest/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/rest/v1")
    }
}

/// PostgREST horizontal filter operand for an equality match.
pub fn filter_param(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "is.null".to_string(),
        JsonValue::String(s) => format!("eq.{s}"),
        other => format!("eq.{other}"),
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_id: i64,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn insert(&mut self, mut row: Row) -> Row {
        self.next_id += 1;
        row.insert("id".to_string(), JsonValue::from(self.next_id));
        self.rows.push(row.clone());
        row
    }
}

/// In-process table store with bigint ids assigned from 1 per table.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }
}

fn matches(row: &Row, filter: &[(&str, JsonValue)]) -> bool {
    filter
        .iter()
        .all(|(column, value)| row.get(*column).unwrap_or(&JsonValue::Null) == value)
}

#[async_trait]
impl TableSink for MemorySink {
    async fn find(&self, table: &str, filter: &[(&str, JsonValue)]) -> Result<Vec<Row>, SinkError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|t| t.rows.iter().filter(|row| matches(row, filter)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, SinkError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.entry(table.to_string()).or_default().insert(row))
    }

    async fn update(&self, table: &str, id: i64, fields: Row) -> Result<(), SinkError> {
        let mut tables = self.tables.lock().await;
        let id_value = JsonValue::from(id);
        if let Some(existing) = tables
            .get_mut(table)
            .and_then(|t| t.rows.iter_mut().find(|row| row.get("id") == Some(&id_value)))
        {
            for (column, value) in fields {
                if column != "id" {
                    existing.insert(column, value);
                }
            }
        }
        Ok(())
    }

    async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> Result<Row, SinkError> {
        let filter: Vec<(&str, JsonValue)> = on_conflict
            .iter()
            .map(|column| (*column, row.get(*column).cloned().unwrap_or(JsonValue::Null)))
            .collect();

        let mut tables = self.tables.lock().await;
        let store = tables.entry(table.to_string()).or_default();
        if let Some(existing) = store.rows.iter_mut().find(|r| matches(r, &filter)) {
            for (column, value) in row {
                if column != "id" {
                    existing.insert(column, value);
                }
            }
            return Ok(existing.clone());
        }
        Ok(store.insert(row))
    }
}
