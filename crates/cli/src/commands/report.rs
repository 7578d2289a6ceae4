//! Test report command

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use mailproof_common::result::{ReportedIssue, TestSummary};
use mailproof_common::{CompatibilityLevel, RenderJob, Screenshot, Severity, TestResult, TestStatus};
use serde::Serialize;

use super::{parse_job_id, Context};
use crate::output::{or_dash, print_details, print_list, print_serialized, TableDisplay};

#[derive(Args)]
pub struct ReportArgs {
    /// Job ID
    pub job_id: String,
}

/// Issue row, ordered most severe first
#[derive(Serialize)]
pub struct IssueDisplay {
    pub severity: Severity,
    pub client: String,
    pub viewport: String,
    pub category: String,
    pub description: String,
    pub suggestion: Option<String>,
}

impl From<ReportedIssue<'_>> for IssueDisplay {
    fn from(reported: ReportedIssue<'_>) -> Self {
        Self {
            severity: reported.issue.severity,
            client: reported.client_name.to_string(),
            viewport: reported.viewport.to_string(),
            category: reported.issue.category.to_string(),
            description: reported.issue.description.clone(),
            suggestion: reported.issue.suggestion.clone(),
        }
    }
}

impl TableDisplay for IssueDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Severity", "Client", "Viewport", "Category", "Issue", "Suggestion"]
    }

    fn row(&self) -> Vec<String> {
        let severity = match self.severity {
            Severity::Critical => "critical".red().bold().to_string(),
            Severity::Major => "major".yellow().to_string(),
            Severity::Minor => "minor".normal().to_string(),
        };
        vec![
            severity,
            self.client.clone(),
            self.viewport.clone(),
            self.category.clone(),
            self.description.clone(),
            or_dash(self.suggestion.as_deref()),
        ]
    }
}

#[derive(Serialize)]
struct Report {
    job_id: String,
    status: TestStatus,
    overall_score: f64,
    level: CompatibilityLevel,
    summary: TestSummary,
    accessibility_score: Option<f64>,
    optimization_score: Option<f64>,
    deliverability_score: Option<f64>,
    screenshots_matching_baseline: usize,
    screenshots_compared: usize,
    failed_clients: Vec<String>,
    issues: Vec<IssueDisplay>,
}

impl Report {
    fn build(
        job: &RenderJob,
        result: &TestResult,
        screenshots: &[Screenshot],
        threshold: f64,
    ) -> Self {
        let compared: Vec<&Screenshot> = screenshots
            .iter()
            .filter(|s| s.best_comparison().is_some())
            .collect();
        let matching = compared
            .iter()
            .filter(|s| s.best_comparison().map_or(false, |c| c.passes(threshold)))
            .count();

        Self {
            job_id: job.id().to_string(),
            status: result.overall_status(),
            overall_score: result.overall_score(),
            level: result.compatibility_level(),
            summary: result.summary().clone(),
            accessibility_score: result.accessibility_result().map(|r| r.score),
            optimization_score: result.performance_result().map(|r| r.optimization_score),
            deliverability_score: result.spam_result().map(|r| r.deliverability_score),
            screenshots_matching_baseline: matching,
            screenshots_compared: compared.len(),
            failed_clients: result
                .failed_clients()
                .iter()
                .map(|r| format!("{} ({})", r.client_name, r.viewport.name))
                .collect(),
            issues: result.ranked_issues().into_iter().map(IssueDisplay::from).collect(),
        }
    }
}

pub fn execute(args: ReportArgs, ctx: &Context) -> Result<()> {
    let job_id = parse_job_id(&args.job_id)?;
    let job: RenderJob = ctx.db.load(&job_id.to_string())?;
    let result = ctx.db.result_for_job(job_id)?;
    let screenshots: Vec<Screenshot> = ctx.db.list_for_job(job_id)?;

    let threshold = ctx.config.scoring.similarity_threshold;
    let report = Report::build(&job, &result, &screenshots, threshold);
    if print_serialized(&report, ctx.format)? {
        return Ok(());
    }

    let summary = &report.summary;
    let failed_clients = if report.failed_clients.is_empty() {
        "-".to_string()
    } else {
        report.failed_clients.join(", ")
    };
    let score = format!("{:.2} ({})", report.overall_score, report.level);
    let score = match report.level {
        CompatibilityLevel::Excellent | CompatibilityLevel::Good => score.green().to_string(),
        CompatibilityLevel::Fair => score.yellow().to_string(),
        CompatibilityLevel::Poor => score.red().to_string(),
    };
    print_details(&[
        ("Job", report.job_id.clone()),
        ("Job status", job.status().to_string()),
        ("Result", report.status.to_string()),
        ("Overall score", score),
        (
            "Clients",
            format!(
                "{} passed, {} failed, {} expected",
                summary.passed_clients, summary.failed_clients, summary.total_clients
            ),
        ),
        ("Avg compatibility", format!("{:.2}", summary.average_compatibility_score)),
        ("Accessibility", or_dash(report.accessibility_score)),
        ("Performance", or_dash(report.optimization_score)),
        ("Deliverability", or_dash(report.deliverability_score)),
        (
            "Baseline matches",
            format!(
                "{}/{} at {}%",
                report.screenshots_matching_baseline,
                report.screenshots_compared,
                threshold
            ),
        ),
        ("Screenshots", summary.total_screenshots.to_string()),
        ("Render time", format!("{} ms", summary.total_render_time_ms)),
        (
            "Issues",
            format!(
                "{} critical, {} major, {} minor",
                summary.critical_issues, summary.major_issues, summary.minor_issues
            ),
        ),
        ("Failed clients", failed_clients),
        ("Test duration", or_dash(result.metadata().test_duration.map(|s| format!("{} s", s)))),
        ("Error", or_dash(result.error_message())),
    ]);

    if !report.issues.is_empty() {
        print_list(&report.issues, ctx.format)?;
    }
    Ok(())
}
