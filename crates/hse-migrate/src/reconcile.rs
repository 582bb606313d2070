//! Natural-key upserts of programs and their monthly progress rows.

use std::sync::Arc;

use hse_core::{
    to_columns, Month, MonthData, ProgramKey, ProgramRow, ProgressRow, PROGRAMS_TABLE,
    PROGRAM_KEY_COLUMNS, PROGRESS_KEY_COLUMNS, PROGRESS_TABLE,
};
use hse_sources::SourceError;
use hse_storage::{row_id, Row, SinkError, TableSink};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Look the natural key up, then update the match or insert. Racy across
    /// concurrent runs.
    #[default]
    LookupThenWrite,
    /// One native upsert per row against unique constraints on the natural keys.
    OnConflict,
}

impl WriteStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteStrategy::LookupThenWrite => "lookup-then-write",
            WriteStrategy::OnConflict => "on-conflict",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("encoding row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl ReconcileError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Sink(err) if err.is_transient())
    }
}

pub struct Reconciler {
    sink: Arc<dyn TableSink>,
    strategy: WriteStrategy,
}

impl Reconciler {
    pub fn new(sink: Arc<dyn TableSink>, strategy: WriteStrategy) -> Self {
        Self { sink, strategy }
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    /// Resolve or create the program row for `row`'s natural key; returns its id.
    pub async fn upsert_program(&self, row: &ProgramRow) -> Result<i64, ReconcileError> {
        let columns = to_columns(row)?;
        if self.strategy == WriteStrategy::OnConflict {
            let stored = self
                .sink
                .upsert(PROGRAMS_TABLE, columns, &PROGRAM_KEY_COLUMNS)
                .await?;
            return Ok(row_id(PROGRAMS_TABLE, &stored)?);
        }

        let key = row.key();
        if let Some(existing) = self.lookup(PROGRAMS_TABLE, &program_filter(&key)).await {
            let id = row_id(PROGRAMS_TABLE, &existing)?;
            let mut fields = Row::new();
            fields.insert("plan_type".into(), json!(row.plan_type));
            fields.insert("due_date".into(), json!(row.due_date));
            fields.insert("reference_doc".into(), json!(row.reference_doc));
            self.sink.update(PROGRAMS_TABLE, id, fields).await?;
            debug!(id, title = %key.title, "updated program");
            return Ok(id);
        }

        let stored = self.sink.insert(PROGRAMS_TABLE, columns).await?;
        let id = row_id(PROGRAMS_TABLE, &stored)?;
        debug!(id, title = %key.title, "inserted program");
        Ok(id)
    }

    /// Resolve or create the progress row for (program, month, year) and
    /// overwrite every column, including optionals the source left out.
    pub async fn upsert_progress(
        &self,
        program_id: i64,
        month: Month,
        year: i32,
        data: &MonthData,
    ) -> Result<(), ReconcileError> {
        let columns = to_columns(&ProgressRow::from_month_data(program_id, month, year, data))?;
        if self.strategy == WriteStrategy::OnConflict {
            self.sink
                .upsert(PROGRESS_TABLE, columns, &PROGRESS_KEY_COLUMNS)
                .await?;
            return Ok(());
        }

        let filter = [
            ("program_id", json!(program_id)),
            ("month", json!(month.code())),
            ("year", json!(year)),
        ];
        match self.lookup(PROGRESS_TABLE, &filter).await {
            Some(existing) => {
                let id = row_id(PROGRESS_TABLE, &existing)?;
                self.sink.update(PROGRESS_TABLE, id, columns).await?;
            }
            None => {
                self.sink.insert(PROGRESS_TABLE, columns).await?;
            }
        }
        Ok(())
    }

    // A failed lookup reads as "not found"; the write that follows surfaces
    // any persistent sink failure.
    async fn lookup(&self, table: &str, filter: &[(&str, JsonValue)]) -> Option<Row> {
        match self.sink.find(table, filter).await {
            Ok(rows) => rows.into_iter().next(),
            Err(err) => {
                warn!(table, error = %err, "lookup failed; treating as not found");
                None
            }
        }
    }
}

fn program_filter(key: &ProgramKey) -> [(&'static str, JsonValue); 4] {
    [
        ("title", json!(key.title)),
        ("program_type", json!(key.program_type.as_str())),
        ("region", json!(key.region)),
        ("base", json!(key.base)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hse_core::{ProgramType, ProgressStatus};
    use hse_storage::MemorySink;

    /// Every lookup fails; writes go through.
    struct BlindSink(MemorySink);

    #[async_trait]
    impl TableSink for BlindSink {
        async fn find(&self, table: &str, _filter: &[(&str, JsonValue)]) -> Result<Vec<Row>, SinkError> {
            Err(SinkError::EmptyResponse {
                table: table.to_string(),
                operation: "find",
            })
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, SinkError> {
            self.0.insert(table, row).await
        }

        async fn update(&self, table: &str, id: i64, fields: Row) -> Result<(), SinkError> {
            self.0.update(table, id, fields).await
        }

        async fn upsert(&self, table: &str, row: Row, on_conflict: &[&str]) -> Result<Row, SinkError> {
            self.0.upsert(table, row, on_conflict).await
        }
    }

    fn program(title: &str, plan_type: Option<&str>) -> ProgramRow {
        ProgramRow {
            title: title.to_string(),
            program_type: ProgramType::Otp,
            region: "indonesia".into(),
            base: "duri".into(),
            plan_type: plan_type.map(str::to_string),
            due_date: None,
            reference_doc: None,
        }
    }

    #[tokio::test]
    async fn same_natural_key_updates_in_place() {
        for strategy in [WriteStrategy::LookupThenWrite, WriteStrategy::OnConflict] {
            let sink = Arc::new(MemorySink::new());
            let reconciler = Reconciler::new(sink.clone(), strategy);

            let first = reconciler
                .upsert_program(&program("Fire Drill", Some("Monthly")))
                .await
                .unwrap();
            let second = reconciler
                .upsert_program(&program("Fire Drill", Some("Quarterly")))
                .await
                .unwrap();
            let other = reconciler
                .upsert_program(&program("Toolbox Talk", None))
                .await
                .unwrap();

            assert_eq!(first, second, "{strategy:?}");
            assert_ne!(first, other);
            let rows = sink.rows(PROGRAMS_TABLE).await;
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0]["plan_type"], json!("Quarterly"));
        }
    }

    #[tokio::test]
    async fn different_base_is_a_different_program() {
        let sink = Arc::new(MemorySink::new());
        let reconciler = Reconciler::new(sink.clone(), WriteStrategy::default());
        let duri = program("Fire Drill", None);
        let mut narogong = duri.clone();
        narogong.base = "narogong".into();

        let a = reconciler.upsert_program(&duri).await.unwrap();
        let b = reconciler.upsert_program(&narogong).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn progress_update_is_a_full_replace() {
        let sink = Arc::new(MemorySink::new());
        let reconciler = Reconciler::new(sink.clone(), WriteStrategy::LookupThenWrite);
        let first = MonthData {
            plan: Some(2.0),
            actual: Some(1.0),
            pic_name: Some("Budi".into()),
            evidence_url: Some("https://drive/e1".into()),
            ..Default::default()
        };
        let second = MonthData {
            plan: Some(2.0),
            actual: Some(2.0),
            ..Default::default()
        };

        reconciler.upsert_progress(1, Month::Jan, 2026, &first).await.unwrap();
        reconciler.upsert_progress(1, Month::Jan, 2026, &second).await.unwrap();
        reconciler.upsert_progress(1, Month::Jan, 2027, &second).await.unwrap();

        let rows = sink.rows(PROGRESS_TABLE).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["status"], json!(ProgressStatus::Completed.as_str()));
        assert_eq!(rows[0]["pic_name"], JsonValue::Null);
        assert_eq!(rows[0]["evidence_url"], JsonValue::Null);
        assert_eq!(rows[1]["year"], json!(2027));
    }

    #[tokio::test]
    async fn failed_lookup_is_treated_as_not_found() {
        let reconciler = Reconciler::new(
            Arc::new(BlindSink(MemorySink::new())),
            WriteStrategy::LookupThenWrite,
        );
        let first = reconciler.upsert_program(&program("Fire Drill", None)).await.unwrap();
        let second = reconciler.upsert_program(&program("Fire Drill", None)).await.unwrap();
        assert_ne!(first, second);
    }
}
