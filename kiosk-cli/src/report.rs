//! Report Generation
//!
//! Output formats for evaluation and cycle runs:
//! - JSON (machine-readable)
//! - CSV (spreadsheet-compatible)
//! - Human (terminal)

use crate::executor::{ProjectResult, ProjectStatus};
use chrono::{DateTime, Utc};
use kiosk_logic::CycleSummary;
use serde::{Deserialize, Serialize};

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
    Human,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "human" | "text" => Ok(OutputFormat::Human),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMeta {
    pub schema_version: u32,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Address the server listened on
    pub server: String,
    pub peers: usize,
}

impl ReportMeta {
    pub fn new(server: String, peers: usize) -> Self {
        Self {
            schema_version: 1,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            server,
            peers,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub lost: usize,
    pub total_duration_ms: u64,
}

impl ReportSummary {
    pub fn from_results(results: &[ProjectResult]) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        Self {
            total: results.len(),
            passed: count(ProjectStatus::Passed),
            failed: count(ProjectStatus::Failed),
            timed_out: count(ProjectStatus::TimedOut),
            lost: count(ProjectStatus::Lost),
            total_duration_ms: results.iter().map(|r| r.duration_ms).sum(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Evaluation run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub meta: ReportMeta,
    pub results: Vec<ProjectResult>,
    pub summary: ReportSummary,
}

impl Report {
    pub fn new(meta: ReportMeta, results: Vec<ProjectResult>) -> Self {
        let summary = ReportSummary::from_results(&results);
        Self {
            meta,
            results,
            summary,
        }
    }
}

/// Multi-robot cycle report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub meta: ReportMeta,
    pub template: String,
    pub steps: usize,
    /// `(handler, result name)` per measurement
    pub results: Vec<(String, String)>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn new(meta: ReportMeta, template: &str, summary: &CycleSummary) -> Self {
        Self {
            meta,
            template: template.to_string(),
            steps: summary.steps,
            results: summary
                .results
                .iter()
                .map(|(handler, name)| (handler.to_string(), name.clone()))
                .collect(),
            duration_ms: summary.duration.as_millis() as u64,
        }
    }
}

pub fn generate_json_report<T: Serialize>(report: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// CSV with one row per project
///
/// Columns: `project,status,peer,subprocess_pid,duration_ms,message`
pub fn generate_csv_report(report: &Report) -> String {
    let mut csv = String::new();
    csv.push_str("project,status,peer,subprocess_pid,duration_ms,message\n");

    for result in &report.results {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            escape_csv(&result.project),
            result.status,
            result.peer.as_deref().unwrap_or(""),
            result
                .subprocess_pid
                .map(|pid| pid.to_string())
                .unwrap_or_default(),
            result.duration_ms,
            escape_csv(&result.message),
        ));
    }
    csv
}

pub fn generate_cycle_csv(report: &CycleReport) -> String {
    let mut csv = String::new();
    csv.push_str("handler,result\n");
    for (handler, name) in &report.results {
        csv.push_str(&format!("{},{}\n", handler, escape_csv(name)));
    }
    csv
}

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn format_human_output(report: &Report) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str("Kiosk Evaluation Results\n");
    output.push_str(&"=".repeat(60));
    output.push_str("\n\n");

    for result in &report.results {
        let icon = match result.status {
            ProjectStatus::Passed => "✓",
            ProjectStatus::Failed => "✗",
            ProjectStatus::TimedOut => "⏱",
            ProjectStatus::Lost => "⊘",
        };
        output.push_str(&format!("  {} {}\n", icon, result.project));
        output.push_str(&format!(
            "      peer: {}  pid: {}  time: {} ms\n",
            result.peer.as_deref().unwrap_or("-"),
            result
                .subprocess_pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            result.duration_ms
        ));
        if result.status != ProjectStatus::Passed && !result.message.is_empty() {
            output.push_str(&format!("      error: {}\n", result.message));
        }
    }

    let summary = &report.summary;
    output.push_str("\nSummary\n");
    output.push_str(&"-".repeat(60));
    output.push('\n');
    output.push_str(&format!(
        "  Total: {}  Passed: {}  Failed: {}  Timed out: {}  Lost: {}\n",
        summary.total, summary.passed, summary.failed, summary.timed_out, summary.lost
    ));
    output.push_str(&format!(
        "  Peers: {}  Evaluation time: {} ms\n",
        report.meta.peers, summary.total_duration_ms
    ));
    output
}

pub fn format_cycle_output(report: &CycleReport) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str("Kiosk Measurement Cycle\n");
    output.push_str(&"=".repeat(60));
    output.push_str("\n\n");
    output.push_str(&format!("  template: {}\n", report.template));
    output.push_str(&format!(
        "  steps: {}  instances: {}  time: {} ms\n\n",
        report.steps, report.meta.peers, report.duration_ms
    ));
    for (handler, name) in &report.results {
        output.push_str(&format!("  {} -> {}\n", handler, name));
    }
    output
}
