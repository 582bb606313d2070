//! Core domain model for the HSE program migration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

pub const CRATE_NAME: &str = "hse-core";

/// Year assumed when a source document does not carry one.
pub const DEFAULT_YEAR: i32 = 2026;

pub const PROGRAMS_TABLE: &str = "master_programs";
pub const PROGRESS_TABLE: &str = "program_progress";

/// Natural key columns of `master_programs`.
pub const PROGRAM_KEY_COLUMNS: [&str; 4] = ["title", "program_type", "region", "base"];
/// Natural key columns of `program_progress`.
pub const PROGRESS_KEY_COLUMNS: [&str; 3] = ["program_id", "month", "year"];

/// Calendar month codes as stored in `program_progress.month`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Month {
    Jan,
    Feb,
    Mar,
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
}

impl Month {
    pub const ALL: [Month; 12] = [
        Month::Jan,
        Month::Feb,
        Month::Mar,
        Month::Apr,
        Month::May,
        Month::Jun,
        Month::Jul,
        Month::Aug,
        Month::Sep,
        Month::Oct,
        Month::Nov,
        Month::Dec,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Month::Jan => "jan",
            Month::Feb => "feb",
            Month::Mar => "mar",
            Month::Apr => "apr",
            Month::May => "may",
            Month::Jun => "jun",
            Month::Jul => "jul",
            Month::Aug => "aug",
            Month::Sep => "sep",
            Month::Oct => "oct",
            Month::Nov => "nov",
            Month::Dec => "dec",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Month {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s).ok_or_else(|| format!("unknown month code `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    Otp,
    MatrixAudit,
    MatrixTraining,
    MatrixDrill,
    MatrixMeeting,
}

impl ProgramType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramType::Otp => "otp",
            ProgramType::MatrixAudit => "matrix_audit",
            ProgramType::MatrixTraining => "matrix_training",
            ProgramType::MatrixDrill => "matrix_drill",
            ProgramType::MatrixMeeting => "matrix_meeting",
        }
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress state derived from plan/actual values.
///
/// The store also knows `overdue` and `cancelled`, but those are set by
/// people, never by the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
}

impl ProgressStatus {
    pub fn derive(plan_value: f64, actual_value: f64) -> Self {
        if actual_value >= plan_value && plan_value > 0.0 {
            ProgressStatus::Completed
        } else if actual_value > 0.0 {
            ProgressStatus::InProgress
        } else {
            ProgressStatus::Pending
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }
}

/// One month of a source program entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthData {
    #[serde(default)]
    pub plan: Option<f64>,
    #[serde(default)]
    pub actual: Option<f64>,
    #[serde(default)]
    pub wpts_id: Option<String>,
    #[serde(default)]
    pub plan_date: Option<String>,
    #[serde(default)]
    pub impl_date: Option<String>,
    #[serde(default)]
    pub pic_name: Option<String>,
    #[serde(default)]
    pub pic_email: Option<String>,
    #[serde(default)]
    pub pic_manager: Option<String>,
    #[serde(default)]
    pub pic_manager_email: Option<String>,
    #[serde(default)]
    pub evidence_url: Option<String>,
}

impl MonthData {
    pub fn plan_value(&self) -> f64 {
        self.plan.unwrap_or(0.0)
    }

    pub fn actual_value(&self) -> f64 {
        self.actual.unwrap_or(0.0)
    }

    pub fn status(&self) -> ProgressStatus {
        ProgressStatus::derive(self.plan_value(), self.actual_value())
    }
}

/// Parsed handoff contract from the source loader into the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub name: String,
    pub plan_type: Option<String>,
    pub due_date: Option<String>,
    pub months: BTreeMap<Month, MonthData>,
}

impl ProgramRecord {
    /// Month entry, or an all-zero entry when the source omitted it.
    pub fn month(&self, month: Month) -> MonthData {
        self.months.get(&month).cloned().unwrap_or_default()
    }
}

/// Natural key of a `master_programs` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub title: String,
    pub program_type: ProgramType,
    pub region: String,
    pub base: String,
}

/// Column values of a `master_programs` row, minus the generated columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramRow {
    pub title: String,
    pub program_type: ProgramType,
    pub region: String,
    pub base: String,
    pub plan_type: Option<String>,
    pub due_date: Option<String>,
    pub reference_doc: Option<String>,
}

impl ProgramRow {
    pub fn key(&self) -> ProgramKey {
        ProgramKey {
            title: self.title.clone(),
            program_type: self.program_type,
            region: self.region.clone(),
            base: self.base.clone(),
        }
    }
}

/// Column values of a `program_progress` row, minus the generated columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRow {
    pub program_id: i64,
    pub month: Month,
    pub year: i32,
    #[serde(serialize_with = "serialize_numeric")]
    pub plan_value: f64,
    #[serde(serialize_with = "serialize_numeric")]
    pub actual_value: f64,
    pub wpts_id: Option<String>,
    pub plan_date: Option<String>,
    pub impl_date: Option<String>,
    pub pic_name: Option<String>,
    pub pic_email: Option<String>,
    pub pic_manager: Option<String>,
    pub pic_manager_email: Option<String>,
    pub evidence_url: Option<String>,
    pub status: ProgressStatus,
}

impl ProgressRow {
    pub fn from_month_data(program_id: i64, month: Month, year: i32, data: &MonthData) -> Self {
        Self {
            program_id,
            month,
            year,
            plan_value: data.plan_value(),
            actual_value: data.actual_value(),
            wpts_id: data.wpts_id.clone(),
            plan_date: data.plan_date.clone(),
            impl_date: data.impl_date.clone(),
            pic_name: data.pic_name.clone(),
            pic_email: data.pic_email.clone(),
            pic_manager: data.pic_manager.clone(),
            pic_manager_email: data.pic_manager_email.clone(),
            evidence_url: data.evidence_url.clone(),
            status: data.status(),
        }
    }
}

/// Convert a serializable row into a column map. Absent optionals become `null`.
pub fn to_columns<T: Serialize>(row: &T) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(row)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "row serialized to non-object value: {other}"
        ))),
    }
}

// Integral values go out as JSON integers so integer columns accept them.
fn serialize_numeric<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}
