//! Render jobs
//!
//! A [`RenderJob`] is one submitted request to test a piece of email HTML across a set
//! of clients and viewports. It owns its lifecycle:
//!
//! ```text
//! pending ──queue──▶ queued ──start──▶ processing ──complete──▶ completed
//!    │                  │                  │
//!    └──────────────────┴──────────────────┴──fail / cancel──▶ failed / cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ids::IdGenerator;
use crate::types::{validate_viewports, ImageFormat, Viewport};
use crate::{Error, Result};

const ENTITY: &str = "render job";

/// RFC 5322 line length limit, applied to the subject
pub const MAX_SUBJECT_LEN: usize = 998;

/// Render job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Job priority, persisted as 1-4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JobPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TryFrom<u8> for JobPriority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(JobPriority::Low),
            2 => Ok(JobPriority::Normal),
            3 => Ok(JobPriority::High),
            4 => Ok(JobPriority::Urgent),
            other => Err(Error::validation(
                ENTITY,
                format!("priority must be within 1..=4, got {}", other),
            )),
        }
    }
}

impl From<JobPriority> for u8 {
    fn from(priority: JobPriority) -> Self {
        priority as u8
    }
}

/// Optional analyses a job can request on top of screenshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analysis {
    Accessibility,
    Performance,
    Spam,
}

impl std::fmt::Display for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Analysis::Accessibility => write!(f, "accessibility"),
            Analysis::Performance => write!(f, "performance"),
            Analysis::Spam => write!(f, "spam"),
        }
    }
}

/// What a job should test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJobConfig {
    /// Email client ids to render in
    pub clients: Vec<String>,
    #[serde(default = "Viewport::defaults")]
    pub viewports: Vec<Viewport>,
    #[serde(default = "default_true")]
    pub dark_mode: bool,
    #[serde(default = "default_true")]
    pub accessibility: bool,
    #[serde(default = "default_true")]
    pub performance: bool,
    #[serde(default = "default_true")]
    pub spam_analysis: bool,
    #[serde(default)]
    pub screenshot_format: ImageFormat,
    #[serde(default = "default_quality")]
    pub screenshot_quality: u8,
}

fn default_true() -> bool {
    true
}

fn default_quality() -> u8 {
    90
}

impl RenderJobConfig {
    /// Config for `clients` with default viewports and every analysis enabled
    pub fn new<I, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clients: clients.into_iter().map(Into::into).collect(),
            viewports: Viewport::defaults(),
            dark_mode: true,
            accessibility: true,
            performance: true,
            spam_analysis: true,
            screenshot_format: ImageFormat::Png,
            screenshot_quality: default_quality(),
        }
    }

    pub fn with_viewports(mut self, viewports: Vec<Viewport>) -> Self {
        self.viewports = viewports;
        self
    }

    /// Analyses switched on, in a stable order
    pub fn requested_analyses(&self) -> Vec<Analysis> {
        let mut analyses = Vec::new();
        if self.accessibility {
            analyses.push(Analysis::Accessibility);
        }
        if self.performance {
            analyses.push(Analysis::Performance);
        }
        if self.spam_analysis {
            analyses.push(Analysis::Spam);
        }
        analyses
    }

    pub fn validate(&self) -> Result<()> {
        if self.clients.is_empty() {
            return Err(Error::validation(ENTITY, "at least one client is required"));
        }
        for (i, client) in self.clients.iter().enumerate() {
            if client.trim().is_empty() {
                return Err(Error::validation(ENTITY, "client ids must not be empty"));
            }
            if self.clients[..i].contains(client) {
                return Err(Error::validation(
                    ENTITY,
                    format!("client '{}' listed more than once", client),
                ));
            }
        }
        validate_viewports(ENTITY, &self.viewports)?;
        if !(1..=100).contains(&self.screenshot_quality) {
            return Err(Error::validation(
                ENTITY,
                format!(
                    "screenshot quality must be within 1..=100, got {}",
                    self.screenshot_quality
                ),
            ));
        }
        Ok(())
    }
}

/// Persisted layout of a render job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJobData {
    pub id: Uuid,
    pub user_id: String,
    pub template_id: Option<String>,
    pub html_content: String,
    pub subject: Option<String>,
    pub preheader: Option<String>,
    pub config: RenderJobConfig,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub progress: u8,
    pub error_message: Option<String>,
    /// Advisory estimate in seconds
    pub estimated_duration: Option<u64>,
    /// Seconds between start and the terminal transition
    pub actual_duration: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for [`RenderJob::create`]
#[derive(Debug, Clone)]
pub struct CreateRenderJob {
    pub user_id: String,
    pub template_id: Option<String>,
    pub html_content: String,
    pub subject: Option<String>,
    pub preheader: Option<String>,
    pub config: RenderJobConfig,
    pub priority: JobPriority,
}

impl CreateRenderJob {
    pub fn new(
        user_id: impl Into<String>,
        html_content: impl Into<String>,
        config: RenderJobConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            template_id: None,
            html_content: html_content.into(),
            subject: None,
            preheader: None,
            config,
            priority: JobPriority::Normal,
        }
    }
}

/// Fields [`RenderJob::update`] may change; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct RenderJobUpdate {
    pub html_content: Option<String>,
    pub subject: Option<String>,
    pub preheader: Option<String>,
    pub priority: Option<JobPriority>,
    pub config: Option<RenderJobConfig>,
}

/// A validated render job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RenderJobData", into = "RenderJobData")]
pub struct RenderJob {
    data: RenderJobData,
}

impl RenderJob {
    /// Validate `params` and build a pending job
    pub fn create(params: CreateRenderJob, ids: &dyn IdGenerator) -> Result<Self> {
        let now = Utc::now();
        let data = RenderJobData {
            id: ids.generate(),
            user_id: params.user_id,
            template_id: params.template_id,
            html_content: params.html_content,
            subject: params.subject,
            preheader: params.preheader,
            config: params.config,
            status: JobStatus::Pending,
            priority: params.priority,
            progress: 0,
            error_message: None,
            estimated_duration: None,
            actual_duration: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        let job = Self::from_data(data)?;
        debug!(job_id = %job.id(), tasks = job.total_tasks(), "Created render job");
        Ok(job)
    }

    /// Rebuild a job from persisted data, re-checking every invariant
    pub fn from_data(data: RenderJobData) -> Result<Self> {
        validate_data(&data)?;
        Ok(Self { data })
    }

    pub fn to_data(&self) -> RenderJobData {
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

    pub fn user_id(&self) -> &str {
        &self.data.user_id
    }

    pub fn template_id(&self) -> Option<&str> {
        self.data.template_id.as_deref()
    }

    pub fn html_content(&self) -> &str {
        &self.data.html_content
    }

    pub fn subject(&self) -> Option<&str> {
        self.data.subject.as_deref()
    }

    pub fn preheader(&self) -> Option<&str> {
        self.data.preheader.as_deref()
    }

    pub fn config(&self) -> &RenderJobConfig {
        &self.data.config
    }

    pub fn status(&self) -> JobStatus {
        self.data.status
    }

    pub fn priority(&self) -> JobPriority {
        self.data.priority
    }

    pub fn progress(&self) -> u8 {
        self.data.progress
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.error_message.as_deref()
    }

    pub fn estimated_duration(&self) -> Option<u64> {
        self.data.estimated_duration
    }

    pub fn actual_duration(&self) -> Option<u64> {
        self.data.actual_duration
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.data.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.data.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.data.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.data.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.data.status.is_terminal()
    }

    /// Number of client x viewport pairs to render
    pub fn total_tasks(&self) -> usize {
        self.data.config.clients.len() * self.data.config.viewports.len()
    }

    /// Upper bound of screenshots, counting a dark pass per task when requested
    pub fn capture_count(&self) -> usize {
        let themes = if self.data.config.dark_mode { 2 } else { 1 };
        self.total_tasks() * themes
    }

    pub fn requested_analyses(&self) -> Vec<Analysis> {
        self.data.config.requested_analyses()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn queue(&mut self) -> Result<()> {
        self.require(JobStatus::Pending, "queue")?;
        self.transition(JobStatus::Queued);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.require(JobStatus::Queued, "start")?;
        self.data.started_at = Some(Utc::now());
        self.transition(JobStatus::Processing);
        Ok(())
    }

    /// Record progress (0-100) while processing
    pub fn update_progress(&mut self, progress: u8) -> Result<()> {
        self.require(JobStatus::Processing, "update progress")?;
        if progress > 100 {
            return Err(Error::validation(
                ENTITY,
                format!("progress must be within 0..=100, got {}", progress),
            ));
        }
        self.data.progress = progress;
        self.data.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.require(JobStatus::Processing, "complete")?;
        self.data.progress = 100;
        self.finish(JobStatus::Completed);
        info!(
            job_id = %self.data.id,
            duration_secs = self.data.actual_duration.unwrap_or_default(),
            "Render job completed"
        );
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.require_active("fail")?;
        self.data.error_message = Some(message.into());
        self.finish(JobStatus::Failed);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.require_active("cancel")?;
        self.finish(JobStatus::Cancelled);
        Ok(())
    }

    /// Edit a job that has not been queued yet
    pub fn update(&mut self, update: RenderJobUpdate) -> Result<()> {
        self.require(JobStatus::Pending, "update")?;

        let mut staged = self.data.clone();
        if let Some(html) = update.html_content {
            staged.html_content = html;
        }
        if let Some(subject) = update.subject {
            staged.subject = Some(subject);
        }
        if let Some(preheader) = update.preheader {
            staged.preheader = Some(preheader);
        }
        if let Some(priority) = update.priority {
            staged.priority = priority;
        }
        if let Some(config) = update.config {
            staged.config = config;
        }
        staged.updated_at = Utc::now();
        validate_data(&staged)?;

        self.data = staged;
        Ok(())
    }

    /// Advisory scheduling estimate in seconds
    pub fn set_estimated_duration(&mut self, seconds: u64) {
        self.data.estimated_duration = Some(seconds);
        self.data.updated_at = Utc::now();
    }

    fn require(&self, required: JobStatus, action: &'static str) -> Result<()> {
        if self.data.status != required {
            return Err(Error::transition(
                ENTITY,
                action,
                self.data.status,
                format!("'{}'", required),
            ));
        }
        Ok(())
    }

    fn require_active(&self, action: &'static str) -> Result<()> {
        if self.data.status.is_terminal() {
            return Err(Error::transition(
                ENTITY,
                action,
                self.data.status,
                "a non-terminal status",
            ));
        }
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) {
        debug!(job_id = %self.data.id, from = %self.data.status, to = %to, "Render job transition");
        self.data.status = to;
        self.data.updated_at = Utc::now();
    }

    fn finish(&mut self, to: JobStatus) {
        let now = Utc::now();
        self.data.completed_at = Some(now);
        self.data.actual_duration = self
            .data
            .started_at
            .map(|started| (now - started).num_seconds().max(0) as u64);
        self.transition(to);
    }
}

impl TryFrom<RenderJobData> for RenderJob {
    type Error = Error;

    fn try_from(data: RenderJobData) -> Result<Self> {
        Self::from_data(data)
    }
}

impl From<RenderJob> for RenderJobData {
    fn from(job: RenderJob) -> Self {
        job.data
    }
}

fn validate_data(data: &RenderJobData) -> Result<()> {
    if data.user_id.trim().is_empty() {
        return Err(Error::validation(ENTITY, "user id must not be empty"));
    }
    if data.html_content.trim().is_empty() {
        return Err(Error::validation(ENTITY, "html content must not be empty"));
    }
    if let Some(subject) = &data.subject {
        if subject.chars().count() > MAX_SUBJECT_LEN {
            return Err(Error::validation(
                ENTITY,
                format!("subject exceeds {} characters", MAX_SUBJECT_LEN),
            ));
        }
    }
    data.config.validate()?;

    if data.progress > 100 {
        return Err(Error::validation(
            ENTITY,
            format!("progress must be within 0..=100, got {}", data.progress),
        ));
    }
    if data.progress > 0 && data.status == JobStatus::Pending {
        return Err(Error::validation(ENTITY, "a pending job cannot report progress"));
    }
    if data.status == JobStatus::Processing && data.started_at.is_none() {
        return Err(Error::validation(ENTITY, "processing job is missing started_at"));
    }
    if data.status == JobStatus::Completed && data.completed_at.is_none() {
        return Err(Error::validation(ENTITY, "completed job is missing completed_at"));
    }
    if let (Some(started), Some(completed)) = (data.started_at, data.completed_at) {
        if completed < started {
            return Err(Error::validation(ENTITY, "completed_at precedes started_at"));
        }
    }
    Ok(())
}
