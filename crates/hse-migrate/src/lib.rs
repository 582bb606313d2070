//! OTP migration pipeline: load source documents, reconcile programs and
//! monthly progress into the table sink, count what landed.

pub mod config;
pub mod reconcile;
pub mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hse_core::{Month, ProgramRow, ProgramType};
use hse_sources::{entry_title, load_source_document, parse_program_entry, SourceFile, OTP_SOURCES};
use hse_storage::{MemorySink, RestSink, TableSink};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{data_dir_from_env, ConfigError, MigrateConfig};
pub use reconcile::{ReconcileError, Reconciler, WriteStrategy};

pub const CRATE_NAME: &str = "hse-migrate";

const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RegionStats {
    pub region_key: String,
    pub filename: String,
    pub year: i32,
    pub entries: usize,
    pub migrated: usize,
    /// Set when the document existed but could not be read or parsed.
    pub document_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramFailure {
    pub region_key: String,
    pub title: String,
    pub error: String,
    pub transient: bool,
    /// Program row written before the failure, if any.
    pub program_id: Option<i64>,
    /// Progress rows written before the failure.
    pub months_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub strategy: WriteStrategy,
    pub total: usize,
    pub by_region: Vec<RegionStats>,
    pub failures: Vec<ProgramFailure>,
}

impl MigrationStats {
    pub fn migrated_for(&self, region_key: &str) -> Option<usize> {
        self.by_region
            .iter()
            .find(|r| r.region_key == region_key)
            .map(|r| r.migrated)
    }
}

struct PartialWrite {
    program_id: Option<i64>,
    months_written: usize,
    error: ReconcileError,
}

impl PartialWrite {
    fn before_program(error: impl Into<ReconcileError>) -> Self {
        Self {
            program_id: None,
            months_written: 0,
            error: error.into(),
        }
    }
}

pub struct Migrator {
    reconciler: Reconciler,
    data_dir: PathBuf,
    program_type: ProgramType,
}

impl Migrator {
    pub fn new(sink: Arc<dyn TableSink>, data_dir: impl Into<PathBuf>, strategy: WriteStrategy) -> Self {
        Self {
            reconciler: Reconciler::new(sink, strategy),
            data_dir: data_dir.into(),
            program_type: ProgramType::Otp,
        }
    }

    /// Migrate every listed source in order. Per-program failures are logged
    /// and recorded; they never stop the run.
    pub async fn migrate(&self, sources: &[SourceFile]) -> MigrationStats {
        let run_id = Uuid::new_v4();
        let span = info_span!("migration", %run_id, strategy = self.reconciler.strategy().as_str());
        self.migrate_inner(run_id, sources).instrument(span).await
    }

    async fn migrate_inner(&self, run_id: Uuid, sources: &[SourceFile]) -> MigrationStats {
        let started_at = Utc::now();
        let mut by_region = Vec::with_capacity(sources.len());
        let mut failures = Vec::new();
        let mut total = 0usize;

        for source in sources {
            let region_key = source.region_key();
            info!(file = source.filename, region_key = %region_key, "loading source document");

            let mut stats = RegionStats {
                region_key: region_key.clone(),
                filename: source.filename.to_string(),
                year: hse_core::DEFAULT_YEAR,
                entries: 0,
                migrated: 0,
                document_error: None,
            };

            let document = match load_source_document(&self.data_dir, source.filename) {
                Ok(document) => document,
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(file = source.filename, error = %message, "skipping unreadable source document");
                    stats.document_error = Some(message);
                    by_region.push(stats);
                    continue;
                }
            };
            stats.year = document.year;
            stats.entries = document.programs.len();

            for (offset, entry) in document.programs.iter().enumerate() {
                let index = offset + 1;
                match self.migrate_program(source, document.year, index, entry).await {
                    Ok(_) => {
                        stats.migrated += 1;
                        total += 1;
                    }
                    Err(partial) => {
                        let title = entry_title(index, entry);
                        warn!(
                            title = %title,
                            region_key = %region_key,
                            program_id = ?partial.program_id,
                            months_written = partial.months_written,
                            error = %partial.error,
                            "failed to migrate program"
                        );
                        failures.push(ProgramFailure {
                            region_key: region_key.clone(),
                            title,
                            error: partial.error.to_string(),
                            transient: partial.error.is_transient(),
                            program_id: partial.program_id,
                            months_written: partial.months_written,
                        });
                    }
                }

                if index % PROGRESS_EVERY == 0 {
                    info!("processed {index}/{} programs", stats.entries);
                }
            }

            info!(
                file = source.filename,
                migrated = stats.migrated,
                entries = stats.entries,
                "source document migrated"
            );
            by_region.push(stats);
        }

        MigrationStats {
            run_id,
            started_at,
            finished_at: Utc::now(),
            strategy: self.reconciler.strategy(),
            total,
            by_region,
            failures,
        }
    }

    async fn migrate_program(
        &self,
        source: &SourceFile,
        year: i32,
        index: usize,
        entry: &JsonValue,
    ) -> Result<i64, PartialWrite> {
        let record = parse_program_entry(index, entry).map_err(PartialWrite::before_program)?;
        let row = ProgramRow {
            title: record.name.clone(),
            program_type: self.program_type,
            region: source.region.to_string(),
            base: source.base.to_string(),
            plan_type: record.plan_type.clone(),
            due_date: record.due_date.clone(),
            reference_doc: None,
        };
        let program_id = self
            .reconciler
            .upsert_program(&row)
            .await
            .map_err(PartialWrite::before_program)?;

        for (months_written, month) in Month::ALL.into_iter().enumerate() {
            self.reconciler
                .upsert_progress(program_id, month, year, &record.month(month))
                .await
                .map_err(|error| PartialWrite {
                    program_id: Some(program_id),
                    months_written,
                    error,
                })?;
        }
        Ok(program_id)
    }
}

/// Run against the configured PostgREST endpoint.
pub async fn run_once(config: &MigrateConfig, strategy: WriteStrategy) -> Result<MigrationStats> {
    let sink = RestSink::new(config.rest_client_config()).context("building datastore client")?;
    info!(endpoint = %config.supabase_url, "connected to datastore");
    let migrator = Migrator::new(Arc::new(sink), config.data_dir.clone(), strategy);
    Ok(migrator.migrate(&OTP_SOURCES).await)
}

/// Run the full pipeline against an in-memory store; nothing leaves the process.
pub async fn run_dry(data_dir: impl Into<PathBuf>, strategy: WriteStrategy) -> MigrationStats {
    let migrator = Migrator::new(Arc::new(MemorySink::new()), data_dir, strategy);
    migrator.migrate(&OTP_SOURCES).await
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub region_key: String,
    pub filename: String,
    pub present: bool,
}

pub fn source_statuses(data_dir: &Path) -> Vec<SourceStatus> {
    OTP_SOURCES
        .iter()
        .map(|s| SourceStatus {
            region_key: s.region_key(),
            filename: s.filename.to_string(),
            present: s.path_in(data_dir).is_file(),
        })
        .collect()
}
