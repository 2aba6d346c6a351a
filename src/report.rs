use chrono::{DateTime, Local};
use comfy_table::{Attribute, Cell, ContentArrangement, Table, presets::UTF8_FULL};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::quiesce::LockState;

/// Terminal record of one run. Printed as a table for operators or as JSON
/// with `--json`; nothing is persisted.
#[derive(Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub snapshot_cmd: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub hosts: Vec<HostOutcome>,
}

#[derive(Serialize)]
pub struct HostOutcome {
    pub host: String,
    /// Last lock state the controller reached before terminating.
    pub lock_state_reached: LockState,
    pub snapshot_taken: bool,
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// Short correlation id for a run, derived from the seed alone so the same
/// seed always maps to the same id.
pub fn run_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    format!("run-{}", &hex::encode(digest)[..8])
}

pub fn render_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Host").add_attribute(Attribute::Bold),
            Cell::new("Lock state").add_attribute(Attribute::Bold),
            Cell::new("Snapshot").add_attribute(Attribute::Bold),
            Cell::new("Duration").add_attribute(Attribute::Bold),
            Cell::new("Detail").add_attribute(Attribute::Bold),
        ]);

    for outcome in &report.hosts {
        table.add_row(vec![
            Cell::new(&outcome.host),
            Cell::new(outcome.lock_state_reached.to_string()),
            Cell::new(if outcome.snapshot_taken { "taken" } else { "failed" }),
            Cell::new(format!("{} ms", outcome.duration_ms)),
            Cell::new(outcome.detail.as_deref().unwrap_or("-")),
        ]);
    }

    table
}

pub fn to_json(report: &RunReport) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}
