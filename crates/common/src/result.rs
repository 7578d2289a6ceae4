//! Test results
//!
//! A [`TestResult`] is the root aggregate of one render job's outcome: one
//! [`ClientTestResult`] per client/viewport pair, the optional analyzer outputs, derived
//! summary counters and the weighted overall score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ids::IdGenerator;
use crate::job::{Analysis, RenderJob};
use crate::score::{
    CompatibilityLevel, ScoreAccumulator, ACCESSIBILITY_WEIGHT, COMPATIBILITY_WEIGHT,
    DELIVERABILITY_WEIGHT, PERFORMANCE_WEIGHT,
};
use crate::screenshot::Screenshot;
use crate::types::{check_percent, round2, Viewport};
use crate::{Error, Result};

const ENTITY: &str = "test result";

/// Overall or per-client test status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
}

impl TestStatus {
    /// Passed or failed: the test ran to a verdict
    pub fn is_completed(self) -> bool {
        matches!(self, TestStatus::Passed | TestStatus::Failed)
    }

    /// Failed or errored
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Error)
    }
}

impl Default for TestStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pending => write!(f, "pending"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Error => write!(f, "error"),
        }
    }
}

/// Issue severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Major => write!(f, "major"),
            Severity::Minor => write!(f, "minor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Css,
    Layout,
    Images,
    Fonts,
    DarkMode,
    Links,
    Media,
    Other,
}

impl std::fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueCategory::Css => write!(f, "css"),
            IssueCategory::Layout => write!(f, "layout"),
            IssueCategory::Images => write!(f, "images"),
            IssueCategory::Fonts => write!(f, "fonts"),
            IssueCategory::DarkMode => write!(f, "dark_mode"),
            IssueCategory::Links => write!(f, "links"),
            IssueCategory::Media => write!(f, "media"),
            IssueCategory::Other => write!(f, "other"),
        }
    }
}

/// A rendering problem found in one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub description: String,
    /// CSS selector or tag the issue was observed on
    #[serde(default)]
    pub element: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl CompatibilityIssue {
    pub fn new(
        severity: Severity,
        category: IssueCategory,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            description: description.into(),
            element: None,
            suggestion: None,
        }
    }
}

/// Outcome for one client at one viewport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTestResult {
    pub client_id: String,
    pub client_name: String,
    pub viewport: Viewport,
    pub status: TestStatus,
    pub compatibility_score: f64,
    #[serde(default)]
    pub issues: Vec<CompatibilityIssue>,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
    /// Milliseconds spent rendering this client
    pub render_time_ms: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub tested_at: DateTime<Utc>,
}

impl ClientTestResult {
    pub fn new(
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        viewport: Viewport,
        status: TestStatus,
        compatibility_score: f64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_name: client_name.into(),
            viewport,
            status,
            compatibility_score,
            issues: Vec::new(),
            screenshots: Vec::new(),
            render_time_ms: 0,
            error_message: None,
            tested_at: Utc::now(),
        }
    }

    pub fn compatibility_level(&self) -> CompatibilityLevel {
        CompatibilityLevel::from_score(self.compatibility_score)
    }

    pub fn issue_count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    fn same_slot(&self, other: &ClientTestResult) -> bool {
        self.client_id == other.client_id && self.viewport.name == other.viewport.name
    }

    fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::validation(ENTITY, "client result is missing a client id"));
        }
        self.viewport.validate(ENTITY)?;
        check_percent(ENTITY, "compatibility score", self.compatibility_score)?;
        if let Some(shot) = self.screenshots.iter().find(|s| s.client_id() != self.client_id) {
            return Err(Error::validation(
                ENTITY,
                format!(
                    "screenshot {} belongs to '{}', not '{}'",
                    shot.id(),
                    shot.client_id(),
                    self.client_id
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcagLevel {
    A,
    #[serde(rename = "AA")]
    Aa,
    #[serde(rename = "AAA")]
    Aaa,
}

impl Default for WcagLevel {
    fn default() -> Self {
        Self::Aa
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessibilityViolation {
    pub rule_id: String,
    pub impact: Severity,
    pub description: String,
    #[serde(default)]
    pub help_url: Option<String>,
    /// Number of offending nodes
    #[serde(default)]
    pub nodes: u32,
}

/// Accessibility analyzer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessibilityResult {
    pub score: f64,
    #[serde(default)]
    pub wcag_level: WcagLevel,
    #[serde(default)]
    pub violations: Vec<AccessibilityViolation>,
    #[serde(default)]
    pub passes: u32,
    pub analyzed_at: DateTime<Utc>,
}

impl AccessibilityResult {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            wcag_level: WcagLevel::default(),
            violations: Vec::new(),
            passes: 0,
            analyzed_at: Utc::now(),
        }
    }
}

/// Performance analyzer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResult {
    pub optimization_score: f64,
    pub html_size_bytes: u64,
    #[serde(default)]
    pub image_count: u32,
    #[serde(default)]
    pub total_image_bytes: u64,
    #[serde(default)]
    pub external_requests: u32,
    #[serde(default)]
    pub load_time_ms: Option<u64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl PerformanceResult {
    pub fn new(optimization_score: f64, html_size_bytes: u64) -> Self {
        Self {
            optimization_score,
            html_size_bytes,
            image_count: 0,
            total_image_bytes: 0,
            external_requests: 0,
            load_time_ms: None,
            recommendations: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamTrigger {
    pub rule: String,
    pub score: f64,
    pub description: String,
}

/// Spam and deliverability analyzer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamResult {
    pub deliverability_score: f64,
    /// Raw filter score; higher is spammier
    pub spam_score: f64,
    pub is_spam: bool,
    #[serde(default)]
    pub triggers: Vec<SpamTrigger>,
    pub analyzed_at: DateTime<Utc>,
}

impl SpamResult {
    pub fn new(deliverability_score: f64, spam_score: f64, is_spam: bool) -> Self {
        Self {
            deliverability_score,
            spam_score,
            is_spam,
            triggers: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }
}

/// Counters derived from the client results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total_clients: u32,
    pub passed_clients: u32,
    /// Failed plus errored
    pub failed_clients: u32,
    /// Mean over passed and failed clients only
    pub average_compatibility_score: f64,
    pub total_render_time_ms: u64,
    pub total_screenshots: u32,
    pub critical_issues: u32,
    pub major_issues: u32,
    pub minor_issues: u32,
}

impl TestSummary {
    fn compute(total_clients: u32, results: &[ClientTestResult]) -> Self {
        let mut summary = TestSummary {
            total_clients,
            ..TestSummary::default()
        };
        let mut completed = 0u32;
        let mut score_sum = 0.0;
        for result in results {
            match result.status {
                TestStatus::Passed => summary.passed_clients += 1,
                TestStatus::Failed | TestStatus::Error => summary.failed_clients += 1,
                TestStatus::Pending | TestStatus::Running => {}
            }
            if result.status.is_completed() {
                completed += 1;
                score_sum += result.compatibility_score;
            }
            summary.total_render_time_ms =
                summary.total_render_time_ms.saturating_add(result.render_time_ms);
            summary.total_screenshots =
                summary.total_screenshots.saturating_add(result.screenshots.len() as u32);
            for issue in &result.issues {
                match issue.severity {
                    Severity::Critical => summary.critical_issues += 1,
                    Severity::Major => summary.major_issues += 1,
                    Severity::Minor => summary.minor_issues += 1,
                }
            }
        }
        if completed > 0 {
            summary.average_compatibility_score = round2(score_sum / completed as f64);
        }
        summary
    }

    fn agrees_with(&self, derived: &TestSummary) -> bool {
        self.total_clients == derived.total_clients
            && self.passed_clients == derived.passed_clients
            && self.failed_clients == derived.failed_clients
            && self.total_render_time_ms == derived.total_render_time_ms
            && self.total_screenshots == derived.total_screenshots
            && self.critical_issues == derived.critical_issues
            && self.major_issues == derived.major_issues
            && self.minor_issues == derived.minor_issues
            && (self.average_compatibility_score - derived.average_compatibility_score).abs()
                <= SCORE_TOLERANCE
    }
}

/// Slack for stored scores that went through a text round trip
const SCORE_TOLERANCE: f64 = 1e-6;

/// Where and how the test ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    /// Wall time between start and completion, in seconds
    pub test_duration: Option<u64>,
    pub environment: String,
    pub version: String,
}

/// Persisted layout of a test result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultData {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: String,
    pub overall_status: TestStatus,
    pub overall_score: f64,
    #[serde(default)]
    pub client_results: Vec<ClientTestResult>,
    pub accessibility_result: Option<AccessibilityResult>,
    pub performance_result: Option<PerformanceResult>,
    pub spam_result: Option<SpamResult>,
    pub summary: TestSummary,
    pub metadata: TestMetadata,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for [`TestResult::create`]
#[derive(Debug, Clone)]
pub struct CreateTestResult {
    pub job_id: Uuid,
    pub user_id: String,
    /// Number of client/viewport results expected
    pub total_clients: u32,
    pub environment: String,
}

impl CreateTestResult {
    pub fn new(job_id: Uuid, user_id: impl Into<String>, total_clients: u32) -> Self {
        Self {
            job_id,
            user_id: user_id.into(),
            total_clients,
            environment: "development".to_string(),
        }
    }

    /// Expect one result per client/viewport pair of `job`
    pub fn for_job(job: &RenderJob) -> Self {
        Self::new(job.id(), job.user_id(), job.total_tasks() as u32)
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

/// A compatibility issue together with the client it was found in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportedIssue<'a> {
    pub client_id: &'a str,
    pub client_name: &'a str,
    pub viewport: &'a str,
    pub issue: &'a CompatibilityIssue,
}

/// A validated test result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TestResultData", into = "TestResultData")]
pub struct TestResult {
    data: TestResultData,
}

impl TestResult {
    pub fn create(params: CreateTestResult, ids: &dyn IdGenerator) -> Result<Self> {
        let now = Utc::now();
        Self::from_data(TestResultData {
            id: ids.generate(),
            job_id: params.job_id,
            user_id: params.user_id,
            overall_status: TestStatus::Pending,
            overall_score: 0.0,
            client_results: Vec::new(),
            accessibility_result: None,
            performance_result: None,
            spam_result: None,
            summary: TestSummary::compute(params.total_clients, &[]),
            metadata: TestMetadata {
                test_duration: None,
                environment: params.environment,
                version: crate::VERSION.to_string(),
            },
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn from_data(data: TestResultData) -> Result<Self> {
        validate_data(&data)?;
        Ok(Self { data })
    }

    pub fn to_data(&self) -> TestResultData {
        self.data.clone()
    }

    pub fn validate(&self) -> Result<()> {
        validate_data(&self.data)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> Uuid {
        self.data.id
    }

    pub fn job_id(&self) -> Uuid {
        self.data.job_id
    }

    pub fn user_id(&self) -> &str {
        &self.data.user_id
    }

    pub fn overall_status(&self) -> TestStatus {
        self.data.overall_status
    }

    pub fn overall_score(&self) -> f64 {
        self.data.overall_score
    }

    pub fn client_results(&self) -> &[ClientTestResult] {
        &self.data.client_results
    }

    pub fn accessibility_result(&self) -> Option<&AccessibilityResult> {
        self.data.accessibility_result.as_ref()
    }

    pub fn performance_result(&self) -> Option<&PerformanceResult> {
        self.data.performance_result.as_ref()
    }

    pub fn spam_result(&self) -> Option<&SpamResult> {
        self.data.spam_result.as_ref()
    }

    pub fn summary(&self) -> &TestSummary {
        &self.data.summary
    }

    pub fn metadata(&self) -> &TestMetadata {
        &self.data.metadata
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.error_message.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.data.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.data.completed_at
    }

    pub fn is_finished(&self) -> bool {
        !matches!(
            self.data.overall_status,
            TestStatus::Pending | TestStatus::Running
        )
    }

    pub fn has_analysis(&self, analysis: Analysis) -> bool {
        match analysis {
            Analysis::Accessibility => self.data.accessibility_result.is_some(),
            Analysis::Performance => self.data.performance_result.is_some(),
            Analysis::Spam => self.data.spam_result.is_some(),
        }
    }

    /// Every expected client/viewport pair has reported
    pub fn has_all_client_results(&self) -> bool {
        self.data.client_results.len() as u32 >= self.data.summary.total_clients
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn start(&mut self) -> Result<()> {
        self.require(TestStatus::Pending, "start")?;
        self.data.started_at = Some(Utc::now());
        self.transition(TestStatus::Running);
        Ok(())
    }

    /// Insert or replace the result for `(client_id, viewport.name)`
    pub fn add_client_result(&mut self, result: ClientTestResult) -> Result<()> {
        self.require(TestStatus::Running, "add client result")?;
        result.validate()?;

        let mut staged = self.data.clone();
        match staged.client_results.iter_mut().find(|r| r.same_slot(&result)) {
            Some(existing) => *existing = result,
            None => {
                if staged.client_results.len() as u32 >= staged.summary.total_clients {
                    return Err(Error::validation(
                        ENTITY,
                        format!(
                            "all {} expected client results are already present",
                            staged.summary.total_clients
                        ),
                    ));
                }
                staged.client_results.push(result);
            }
        }
        recompute(&mut staged);
        staged.updated_at = Utc::now();
        validate_data(&staged)?;

        self.data = staged;
        Ok(())
    }

    pub fn set_accessibility_result(&mut self, result: AccessibilityResult) -> Result<()> {
        self.require_open("set accessibility result")?;
        check_percent(ENTITY, "accessibility score", result.score)?;
        self.data.accessibility_result = Some(result);
        self.refresh_score();
        Ok(())
    }

    pub fn set_performance_result(&mut self, result: PerformanceResult) -> Result<()> {
        self.require_open("set performance result")?;
        check_percent(ENTITY, "optimization score", result.optimization_score)?;
        self.data.performance_result = Some(result);
        self.refresh_score();
        Ok(())
    }

    pub fn set_spam_result(&mut self, result: SpamResult) -> Result<()> {
        self.require_open("set spam result")?;
        check_percent(ENTITY, "deliverability score", result.deliverability_score)?;
        self.data.spam_result = Some(result);
        self.refresh_score();
        Ok(())
    }

    /// Recompute the weighted overall score from whatever signals are present
    pub fn update_overall_score(&mut self) {
        self.refresh_score();
    }

    /// Finish the run, classifying error > failed > passed from the client results
    pub fn complete(&mut self) -> Result<()> {
        self.require(TestStatus::Running, "complete")?;

        let results = &self.data.client_results;
        let status = if results.iter().any(|r| r.status == TestStatus::Error) {
            TestStatus::Error
        } else if results.iter().any(|r| r.status == TestStatus::Failed) {
            TestStatus::Failed
        } else {
            TestStatus::Passed
        };

        recompute(&mut self.data);
        self.finish(status);
        info!(
            result_id = %self.data.id,
            job_id = %self.data.job_id,
            status = %status,
            score = self.data.overall_score,
            "Test result completed"
        );
        Ok(())
    }

    /// Complete this result and its render job together
    pub fn complete_job(&mut self, job: &mut RenderJob) -> Result<()> {
        if job.id() != self.data.job_id {
            return Err(Error::validation(
                ENTITY,
                format!("result belongs to job {}, not {}", self.data.job_id, job.id()),
            ));
        }
        let mut staged_result = self.clone();
        let mut staged_job = job.clone();
        staged_result.complete()?;
        staged_job.complete()?;

        *self = staged_result;
        *job = staged_job;
        Ok(())
    }

    /// Abort to `error` regardless of the current state
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(
            result_id = %self.data.id,
            job_id = %self.data.job_id,
            "Test result failed: {}",
            message
        );
        self.data.error_message = Some(message);
        self.finish(TestStatus::Error);
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn compatibility_level(&self) -> CompatibilityLevel {
        CompatibilityLevel::from_score(self.data.overall_score)
    }

    pub fn failed_clients(&self) -> Vec<&ClientTestResult> {
        self.data
            .client_results
            .iter()
            .filter(|r| r.status.is_unsuccessful())
            .collect()
    }

    pub fn critical_issues(&self) -> Vec<ReportedIssue<'_>> {
        self.issues()
            .filter(|i| i.issue.severity == Severity::Critical)
            .collect()
    }

    /// Every issue, critical first, then by client name
    pub fn ranked_issues(&self) -> Vec<ReportedIssue<'_>> {
        let mut issues: Vec<_> = self.issues().collect();
        issues.sort_by(|a, b| {
            a.issue
                .severity
                .cmp(&b.issue.severity)
                .then_with(|| a.client_name.cmp(b.client_name))
                .then_with(|| a.viewport.cmp(b.viewport))
        });
        issues
    }

    fn issues(&self) -> impl Iterator<Item = ReportedIssue<'_>> {
        self.data.client_results.iter().flat_map(|result| {
            result.issues.iter().map(move |issue| ReportedIssue {
                client_id: &result.client_id,
                client_name: &result.client_name,
                viewport: &result.viewport.name,
                issue,
            })
        })
    }

    fn require(&self, required: TestStatus, action: &'static str) -> Result<()> {
        if self.data.overall_status != required {
            return Err(Error::transition(
                ENTITY,
                action,
                self.data.overall_status,
                format!("'{}'", required),
            ));
        }
        Ok(())
    }

    fn require_open(&self, action: &'static str) -> Result<()> {
        if self.is_finished() {
            return Err(Error::transition(
                ENTITY,
                action,
                self.data.overall_status,
                "'pending' or 'running'",
            ));
        }
        Ok(())
    }

    fn refresh_score(&mut self) {
        self.data.overall_score = overall_score(&self.data);
        self.data.updated_at = Utc::now();
    }

    fn transition(&mut self, to: TestStatus) {
        debug!(
            result_id = %self.data.id,
            from = %self.data.overall_status,
            to = %to,
            "Test result transition"
        );
        self.data.overall_status = to;
        self.data.updated_at = Utc::now();
    }

    fn finish(&mut self, to: TestStatus) {
        let now = Utc::now();
        self.data.completed_at = Some(now);
        self.data.metadata.test_duration = self
            .data
            .started_at
            .map(|started| (now - started).num_seconds().max(0) as u64);
        self.transition(to);
    }
}

impl TryFrom<TestResultData> for TestResult {
    type Error = Error;

    fn try_from(data: TestResultData) -> Result<Self> {
        Self::from_data(data)
    }
}

impl From<TestResult> for TestResultData {
    fn from(result: TestResult) -> Self {
        result.data
    }
}

fn recompute(data: &mut TestResultData) {
    data.summary = TestSummary::compute(data.summary.total_clients, &data.client_results);
    data.overall_score = overall_score(data);
}

fn overall_score(data: &TestResultData) -> f64 {
    let compatibility = data
        .client_results
        .iter()
        .any(|r| r.status.is_completed())
        .then_some(data.summary.average_compatibility_score);

    let mut acc = ScoreAccumulator::new();
    acc.add(compatibility, COMPATIBILITY_WEIGHT)
        .add(data.accessibility_result.as_ref().map(|r| r.score), ACCESSIBILITY_WEIGHT)
        .add(
            data.performance_result.as_ref().map(|r| r.optimization_score),
            PERFORMANCE_WEIGHT,
        )
        .add(
            data.spam_result.as_ref().map(|r| r.deliverability_score),
            DELIVERABILITY_WEIGHT,
        );
    acc.finish()
}

fn validate_data(data: &TestResultData) -> Result<()> {
    if data.user_id.trim().is_empty() {
        return Err(Error::validation(ENTITY, "user id must not be empty"));
    }
    check_percent(ENTITY, "overall score", data.overall_score)?;

    let summary = &data.summary;
    if data.client_results.len() as u64 > u64::from(summary.total_clients) {
        return Err(Error::validation(
            ENTITY,
            format!(
                "{} client results for {} expected",
                data.client_results.len(),
                summary.total_clients
            ),
        ));
    }
    if u64::from(summary.passed_clients) + u64::from(summary.failed_clients)
        > u64::from(summary.total_clients)
    {
        return Err(Error::validation(
            ENTITY,
            format!(
                "{} passed + {} failed exceeds {} total clients",
                summary.passed_clients, summary.failed_clients, summary.total_clients
            ),
        ));
    }

    for (i, result) in data.client_results.iter().enumerate() {
        result.validate()?;
        if data.client_results[..i].iter().any(|r| r.same_slot(result)) {
            return Err(Error::validation(
                ENTITY,
                format!(
                    "duplicate result for client '{}' at viewport '{}'",
                    result.client_id, result.viewport.name
                ),
            ));
        }
    }

    // Counters and score are derived; stored copies must agree with the client results
    let derived = TestSummary::compute(summary.total_clients, &data.client_results);
    if !summary.agrees_with(&derived) {
        return Err(Error::validation(
            ENTITY,
            format!(
                "summary does not match client results ({} passed, {} failed, {} screenshots derived)",
                derived.passed_clients, derived.failed_clients, derived.total_screenshots
            ),
        ));
    }
    let expected_score = overall_score(data);
    if (data.overall_score - expected_score).abs() > SCORE_TOLERANCE {
        return Err(Error::validation(
            ENTITY,
            format!(
                "overall score {} does not match the weighted signals ({})",
                data.overall_score, expected_score
            ),
        ));
    }

    if data.overall_status == TestStatus::Passed && derived.failed_clients > 0 {
        return Err(Error::validation(ENTITY, "a passed result cannot have failed clients"));
    }
    if data.overall_status == TestStatus::Running && data.started_at.is_none() {
        return Err(Error::validation(ENTITY, "running result is missing started_at"));
    }
    if data.overall_status.is_completed() && data.completed_at.is_none() {
        return Err(Error::validation(
            ENTITY,
            format!("{} result is missing completed_at", data.overall_status),
        ));
    }

    if let Some(r) = &data.accessibility_result {
        check_percent(ENTITY, "accessibility score", r.score)?;
    }
    if let Some(r) = &data.performance_result {
        check_percent(ENTITY, "optimization score", r.optimization_score)?;
    }
    if let Some(r) = &data.spam_result {
        check_percent(ENTITY, "deliverability score", r.deliverability_score)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::job::{CreateRenderJob, RenderJobConfig};

    fn running(total_clients: u32) -> TestResult {
        let params = CreateTestResult::new(Uuid::from_u128(1), "user-1", total_clients);
        let mut result = TestResult::create(params, &SequentialIds::starting_at(10)).unwrap();
        result.start().unwrap();
        result
    }

    fn client(id: &str, viewport: Viewport, status: TestStatus, score: f64) -> ClientTestResult {
        let mut result = ClientTestResult::new(id, id.to_uppercase(), viewport, status, score);
        result.render_time_ms = 1200;
        result
    }

    #[test]
    fn test_accessibility_only_score() {
        let mut result = running(2);
        result.set_accessibility_result(AccessibilityResult::new(80.0)).unwrap();
        assert_eq!(result.overall_score(), 80.0);
    }

    #[test]
    fn test_score_uses_completed_clients_only() {
        let mut result = running(3);
        result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Passed, 90.0))
            .unwrap();
        result
            .add_client_result(client("yandex", Viewport::desktop(), TestStatus::Failed, 70.0))
            .unwrap();
        result
            .add_client_result(client("mailru", Viewport::desktop(), TestStatus::Error, 0.0))
            .unwrap();

        let summary = result.summary();
        assert_eq!(summary.passed_clients, 1);
        assert_eq!(summary.failed_clients, 2);
        assert_eq!(summary.average_compatibility_score, 80.0);
        assert_eq!(summary.total_render_time_ms, 3600);
        assert_eq!(result.overall_score(), 80.0);

        result.set_performance_result(PerformanceResult::new(60.0, 20_000)).unwrap();
        // (80 * 0.4 + 60 * 0.2) / 0.6
        assert_eq!(result.overall_score(), 73.33);
    }

    #[test]
    fn test_upsert_by_client_and_viewport() {
        let mut result = running(2);
        result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Failed, 50.0))
            .unwrap();
        result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Passed, 95.0))
            .unwrap();
        assert_eq!(result.client_results().len(), 1);
        assert_eq!(result.summary().failed_clients, 0);

        result
            .add_client_result(client("gmail", Viewport::mobile(), TestStatus::Passed, 85.0))
            .unwrap();
        assert_eq!(result.client_results().len(), 2);

        let err = result
            .add_client_result(client("outlook", Viewport::desktop(), TestStatus::Passed, 85.0))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(result.client_results().len(), 2);
    }

    #[test]
    fn test_add_requires_running() {
        let params = CreateTestResult::new(Uuid::from_u128(1), "user-1", 1);
        let mut result = TestResult::create(params, &SequentialIds::new()).unwrap();
        let err = result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Passed, 90.0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_complete_classification() {
        let mut failed = running(2);
        failed
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Passed, 90.0))
            .unwrap();
        failed
            .add_client_result(client("yandex", Viewport::desktop(), TestStatus::Failed, 40.0))
            .unwrap();
        failed.complete().unwrap();
        assert_eq!(failed.overall_status(), TestStatus::Failed);
        assert!(failed.completed_at().is_some());
        assert!(failed.metadata().test_duration.is_some());

        let mut errored = running(2);
        errored
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Failed, 40.0))
            .unwrap();
        errored
            .add_client_result(client("yandex", Viewport::desktop(), TestStatus::Error, 0.0))
            .unwrap();
        errored.complete().unwrap();
        assert_eq!(errored.overall_status(), TestStatus::Error);

        let mut passed = running(1);
        passed
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Passed, 90.0))
            .unwrap();
        passed.complete().unwrap();
        assert_eq!(passed.overall_status(), TestStatus::Passed);
        assert_eq!(passed.summary().failed_clients, 0);
        assert!(passed.complete().is_err());
    }

    #[test]
    fn test_fail_from_any_state() {
        let mut result = running(1);
        result.fail("analyzer timed out");
        assert_eq!(result.overall_status(), TestStatus::Error);
        assert_eq!(result.error_message(), Some("analyzer timed out"));
        assert!(result.set_spam_result(SpamResult::new(90.0, 1.2, false)).is_err());
    }

    #[test]
    fn test_ranked_and_critical_issues() {
        let mut result = running(2);
        let mut yandex = client("yandex", Viewport::desktop(), TestStatus::Failed, 60.0);
        yandex.client_name = "Yandex Mail".to_string();
        yandex.issues = vec![
            CompatibilityIssue::new(Severity::Minor, IssueCategory::Fonts, "web font ignored"),
            CompatibilityIssue::new(Severity::Critical, IssueCategory::Layout, "columns collapse"),
        ];
        let mut gmail = client("gmail", Viewport::desktop(), TestStatus::Failed, 70.0);
        gmail.client_name = "Gmail".to_string();
        gmail.issues = vec![
            CompatibilityIssue::new(Severity::Major, IssueCategory::Css, "style block stripped"),
            CompatibilityIssue::new(Severity::Critical, IssueCategory::DarkMode, "logo invisible"),
        ];
        result.add_client_result(yandex).unwrap();
        result.add_client_result(gmail).unwrap();

        let critical = result.critical_issues();
        assert_eq!(critical.len(), 2);
        assert_eq!(result.summary().critical_issues, 2);
        assert_eq!(result.summary().major_issues, 1);
        assert_eq!(result.summary().minor_issues, 1);

        let ranked: Vec<_> = result
            .ranked_issues()
            .iter()
            .map(|i| (i.issue.severity, i.client_name))
            .collect();
        assert_eq!(
            ranked,
            vec![
                (Severity::Critical, "Gmail"),
                (Severity::Critical, "Yandex Mail"),
                (Severity::Major, "Gmail"),
                (Severity::Minor, "Yandex Mail"),
            ]
        );
        assert_eq!(result.failed_clients().len(), 2);
    }

    #[test]
    fn test_complete_job_together() {
        let ids = SequentialIds::new();
        let config = RenderJobConfig::new(["gmail"]).with_viewports(vec![Viewport::desktop()]);
        let params = CreateRenderJob::new("user-1", "<p>hi</p>", config);
        let mut job = RenderJob::create(params, &ids).unwrap();
        let mut result = TestResult::create(CreateTestResult::for_job(&job), &ids).unwrap();
        result.start().unwrap();
        result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Passed, 88.0))
            .unwrap();

        // job still pending: neither side changes
        assert!(result.complete_job(&mut job).is_err());
        assert_eq!(result.overall_status(), TestStatus::Running);

        job.queue().unwrap();
        job.start().unwrap();
        result.complete_job(&mut job).unwrap();
        assert_eq!(result.overall_status(), TestStatus::Passed);
        assert_eq!(job.progress(), 100);
        assert_eq!(result.compatibility_level(), CompatibilityLevel::Good);
    }

    #[test]
    fn test_data_roundtrip_and_invariants() {
        let mut result = running(2);
        result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Failed, 60.0))
            .unwrap();
        let restored = TestResult::from_data(result.to_data()).unwrap();
        assert_eq!(restored, result);

        let mut broken = result.to_data();
        broken.overall_status = TestStatus::Passed;
        broken.completed_at = Some(Utc::now());
        assert!(TestResult::from_data(broken).is_err());

        let mut broken = result.to_data();
        broken.summary.total_clients = 0;
        assert!(TestResult::from_data(broken).is_err());

        let mut broken = result.to_data();
        broken.overall_score = 101.0;
        assert!(TestResult::from_data(broken).is_err());
    }

    #[test]
    fn test_loading_rederives_summary_and_score() {
        let mut result = running(2);
        result
            .add_client_result(client("gmail", Viewport::desktop(), TestStatus::Failed, 60.0))
            .unwrap();

        let mut stale = result.to_data();
        stale.overall_status = TestStatus::Passed;
        stale.completed_at = Some(Utc::now());
        stale.summary.failed_clients = 0;
        let err = TestResult::from_data(stale).unwrap_err();
        assert!(err.to_string().contains("summary does not match"));

        let mut stale = result.to_data();
        stale.summary.total_screenshots = 7;
        assert!(TestResult::from_data(stale).is_err());

        let mut stale = result.to_data();
        stale.overall_score = 10.0;
        let err = TestResult::from_data(stale).unwrap_err();
        assert!(err.to_string().contains("weighted signals"));

        let json = serde_json::to_string(&result).unwrap();
        let parsed: TestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.summary(), result.summary());
    }

    #[test]
    fn test_huge_counters_are_rejected() {
        let mut data = running(2).to_data();
        data.summary.passed_clients = u32::MAX;
        data.summary.failed_clients = 1;
        let err = TestResult::from_data(data).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let mut result = running(2);
        let mut slow = client("gmail", Viewport::desktop(), TestStatus::Passed, 90.0);
        slow.render_time_ms = u64::MAX;
        result.add_client_result(slow).unwrap();
        let mut slow = client("gmail", Viewport::mobile(), TestStatus::Passed, 90.0);
        slow.render_time_ms = u64::MAX;
        result.add_client_result(slow).unwrap();
        assert_eq!(result.summary().total_render_time_ms, u64::MAX);
        assert!(TestResult::from_data(result.to_data()).is_ok());
    }
}
