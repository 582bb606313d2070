//! Source document table + JSON loading for OTP program exports.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hse_core::{Month, MonthData, ProgramRecord, DEFAULT_YEAR};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "hse-sources";

/// One (region, base) export and the file it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFile {
    pub region: &'static str,
    pub base: &'static str,
    pub filename: &'static str,
}

impl SourceFile {
    /// Key used for per-region counts, e.g. `indonesia_duri`.
    pub fn region_key(&self) -> String {
        format!("{}_{}", self.region, self.base)
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.filename)
    }
}

pub const OTP_SOURCES: [SourceFile; 4] = [
    SourceFile {
        region: "indonesia",
        base: "narogong",
        filename: "otp_indonesia_narogong.json",
    },
    SourceFile {
        region: "indonesia",
        base: "duri",
        filename: "otp_indonesia_duri.json",
    },
    SourceFile {
        region: "indonesia",
        base: "balikpapan",
        filename: "otp_indonesia_balikpapan.json",
    },
    SourceFile {
        region: "asia",
        base: "all",
        filename: "otp_asia_data.json",
    },
];

pub fn source_for(region: &str, base: &str) -> Option<&'static SourceFile> {
    OTP_SOURCES
        .iter()
        .find(|s| s.region == region && s.base == base)
}

/// A loaded export. Program entries stay raw until the reconciler takes them
/// one at a time, so a bad entry only fails itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub year: i32,
    pub programs: Vec<JsonValue>,
}

impl Default for SourceDocument {
    fn default() -> Self {
        Self {
            year: DEFAULT_YEAR,
            programs: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    programs: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct RawProgram {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    plan_type: Option<String>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    months: Option<BTreeMap<String, Option<MonthData>>>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("program entry {index} is malformed: {source}")]
    MalformedProgram {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Load `filename` from `dir`. A missing file yields the empty default
/// document; an unreadable or unparsable one is an error.
pub fn load_source_document(dir: &Path, filename: &str) -> Result<SourceDocument> {
    let path = dir.join(filename);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "source document not found; using empty default");
            return Ok(SourceDocument::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    parse_source_document(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_source_document(text: &str) -> Result<SourceDocument> {
    let raw: RawDocument = serde_json::from_str(text)?;
    Ok(SourceDocument {
        year: raw.year.unwrap_or(DEFAULT_YEAR),
        programs: raw.programs.unwrap_or_default(),
    })
}

/// Title used to identify entry `index` (1-based), even when it is malformed.
pub fn entry_title(index: usize, value: &JsonValue) -> String {
    value
        .get("name")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default_title(index))
}

fn default_title(index: usize) -> String {
    format!("Program {index}")
}

/// Turn raw entry `index` (1-based) into a [`ProgramRecord`].
pub fn parse_program_entry(index: usize, value: &JsonValue) -> Result<ProgramRecord, SourceError> {
    let raw: RawProgram = serde_json::from_value(value.clone())
        .map_err(|source| SourceError::MalformedProgram { index, source })?;

    let mut months = BTreeMap::new();
    for (code, data) in raw.months.unwrap_or_default() {
        match (Month::from_code(&code), data) {
            (Some(month), Some(data)) => {
                months.insert(month, data);
            }
            (Some(_), None) => {}
            (None, _) => debug!(index, code = %code, "ignoring unknown month key"),
        }
    }

    Ok(ProgramRecord {
        name: raw.name.unwrap_or_else(|| default_title(index)),
        plan_type: raw.plan_type,
        due_date: raw.due_date,
        months,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_empty_default() {
        let dir = tempdir().expect("tempdir");
        let doc = load_source_document(dir.path(), "otp_asia_data.json").expect("soft fail");
        assert_eq!(doc, SourceDocument::default());
        assert_eq!(doc.year, 2026);
    }

    #[test]
    fn invalid_json_is_an_error_with_path() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.json"), "{ not json").expect("write");
        let err = load_source_document(dir.path(), "bad.json").expect_err("must fail");
        assert!(format!("{err:#}").contains("bad.json"));
    }

    #[test]
    fn document_defaults_year_and_programs() {
        let doc = parse_source_document(r#"{"programs": null}"#).expect("parse");
        assert_eq!(doc.year, 2026);
        assert!(doc.programs.is_empty());

        let doc = parse_source_document(r#"{"year": 2025, "programs": [{"name": "A"}]}"#)
            .expect("parse");
        assert_eq!(doc.year, 2025);
        assert_eq!(doc.programs.len(), 1);
    }

    #[test]
    fn entry_without_name_gets_positional_title() {
        let record = parse_program_entry(3, &json!({"plan_type": "Annual"})).expect("parse");
        assert_eq!(record.name, "Program 3");
        assert_eq!(record.plan_type.as_deref(), Some("Annual"));
        assert!(record.months.is_empty());
    }

    #[test]
    fn months_keep_known_codes_only() {
        let record = parse_program_entry(
            1,
            &json!({
                "name": "Safety Induction",
                "due_date": "2026-03-31",
                "months": {
                    "jan": {"plan": 2, "actual": 1, "pic_name": "Budi"},
                    "feb": null,
                    "q1": {"plan": 9, "actual": 9}
                }
            }),
        )
        .expect("parse");

        assert_eq!(record.months.len(), 1);
        let jan = record.month(Month::Jan);
        assert_eq!(jan.plan_value(), 2.0);
        assert_eq!(jan.pic_name.as_deref(), Some("Budi"));
        assert_eq!(record.month(Month::Feb), MonthData::default());
    }

    #[test]
    fn malformed_entry_reports_index_and_keeps_title() {
        let value = json!({"name": "Emergency Drill", "months": {"jan": {"plan": "lots"}}});
        let err = parse_program_entry(4, &value).expect_err("string plan is malformed");
        assert!(matches!(err, SourceError::MalformedProgram { index: 4, .. }));
        assert_eq!(entry_title(4, &value), "Emergency Drill");
        assert_eq!(entry_title(5, &json!(42)), "Program 5");
    }
}
