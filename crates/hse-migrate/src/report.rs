//! Console rendering of migration results.

use crate::{MigrationStats, SourceStatus};

pub fn render_summary(stats: &MigrationStats) -> String {
    let mut lines = vec![
        "Migration Summary".to_string(),
        format!("- Run ID: {}", stats.run_id),
        format!("- Strategy: {}", stats.strategy.as_str()),
        format!(
            "- Duration: {} ms",
            (stats.finished_at - stats.started_at).num_milliseconds()
        ),
        format!("Total OTP Programs: {}", stats.total),
    ];

    for region in &stats.by_region {
        let mut line = format!(
            "  - {}: {} programs",
            region.region_key, region.migrated
        );
        if region.migrated != region.entries {
            line.push_str(&format!(" (of {} entries)", region.entries));
        }
        if let Some(err) = &region.document_error {
            line.push_str(&format!(" [document error: {err}]"));
        }
        lines.push(line);
    }

    if !stats.failures.is_empty() {
        lines.push(String::new());
        lines.push(format!("Failed programs: {}", stats.failures.len()));
        for failure in &stats.failures {
            let mut line = format!(
                "  - {} '{}': {}",
                failure.region_key, failure.title, failure.error
            );
            if let Some(id) = failure.program_id {
                line.push_str(&format!(
                    " (program {id} written, {}/12 months written)",
                    failure.months_written
                ));
            }
            if failure.transient {
                line.push_str(" [transient; rerun to retry]");
            }
            lines.push(line);
        }
    }

    lines.join("\n")
}

pub fn render_sources(statuses: &[SourceStatus]) -> String {
    statuses
        .iter()
        .map(|s| {
            format!(
                "{:<24} {:<34} {}",
                s.region_key,
                s.filename,
                if s.present { "present" } else { "missing" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
