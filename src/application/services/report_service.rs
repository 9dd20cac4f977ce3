//! Job history reports.

use std::sync::Arc;

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::ci::pipeline::{HistoryQuery, JobRecord, JobStatus};
use crate::domain::repositories::PipelineStore;
use crate::error::Result;

pub struct ReportService {
    store: Arc<dyn PipelineStore>,
}

impl ReportService {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<JobRecord>> {
        self.store.query_history(query).await
    }
}

fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn status_cell(status: JobStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        JobStatus::Success => cell.fg(TableColor::Green),
        JobStatus::Failed => cell.fg(TableColor::Red),
        JobStatus::Cancelled => cell.fg(TableColor::Yellow),
        JobStatus::Pending | JobStatus::Running => cell,
    }
}

fn duration_text(record: &JobRecord) -> String {
    match (record.log.start_time, record.log.completion_time) {
        (Some(start), Some(end)) => {
            let millis = (end - start).num_milliseconds().max(0);
            format!("{:.1}s", millis as f64 / 1000.0)
        }
        _ => "-".to_string(),
    }
}

/// One row per job run.
pub fn render_table(records: &[JobRecord]) -> String {
    let mut table = create_table();
    table.set_header(vec![
        "Pipeline",
        "Run",
        "Stage",
        "Job",
        "Status",
        "Allow failure",
        "Started",
        "Duration",
    ]);

    for record in records {
        let started = record
            .log
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&record.pipeline_name),
            Cell::new(record.run_number),
            Cell::new(&record.stage),
            Cell::new(&record.log.job_name),
            status_cell(record.log.job_status),
            Cell::new(record.log.allow_failure),
            Cell::new(started),
            Cell::new(duration_text(record)),
        ]);
    }
    table.to_string()
}

/// Full logs of every record, one section per job run.
pub fn render_logs(records: &[JobRecord]) -> String {
    records
        .iter()
        .map(|record| {
            format!(
                "=== {} #{} {}/{} ({}) ===\n{}",
                record.pipeline_name,
                record.run_number,
                record.stage,
                record.log.job_name,
                record.log.job_status,
                if record.log.job_logs.is_empty() {
                    "<no output>"
                } else {
                    record.log.job_logs.as_str()
                }
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
