//! Render job commands

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::Subcommand;
use mailproof_common::aggregator::{spawn_aggregator, Dispatch, JobAggregator, WorkerEvent};
use mailproof_common::job::RenderJobData;
use mailproof_common::{
    CapturePlanner, CaptureTask, CreateRenderJob, CreateTestResult, EmailClient, Error,
    ImageFormat, JobPriority, JobStatus, RandomIds, RenderJob, RenderJobConfig, Screenshot,
    ScreenshotStatus, TestResult,
};
use serde::Serialize;
use tracing::{debug, info};

use super::{parse_job_id, Context};
use crate::output::{
    or_dash, print_details, print_info, print_list, print_serialized, print_success,
    print_warning, timestamp, TableDisplay,
};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit email HTML for rendering
    Submit {
        /// HTML file to render
        #[arg(long)]
        html: PathBuf,

        /// Email client IDs to render in
        #[arg(short, long = "client", required = true, num_args = 1..)]
        clients: Vec<String>,

        /// Subject line
        #[arg(long)]
        subject: Option<String>,

        /// Preheader text
        #[arg(long)]
        preheader: Option<String>,

        /// Priority, 1 (low) to 4 (urgent)
        #[arg(long, default_value_t = 2)]
        priority: u8,

        /// Submitting user
        #[arg(long, env = "MAILPROOF_USER", default_value = "local")]
        user: String,

        /// Screenshot format (defaults to the configured one)
        #[arg(long)]
        image_format: Option<ImageFormat>,

        /// Encoder quality for lossy formats
        #[arg(long)]
        quality: Option<u8>,

        /// Skip the dark-mode pass
        #[arg(long)]
        no_dark_mode: bool,

        /// Skip accessibility analysis
        #[arg(long)]
        no_accessibility: bool,

        /// Skip performance analysis
        #[arg(long)]
        no_performance: bool,

        /// Skip spam analysis
        #[arg(long)]
        no_spam: bool,
    },

    /// List render jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a job and its screenshots
    Show {
        /// Job ID
        id: String,
    },

    /// Show the capture tasks still waiting for a worker
    Plan {
        /// Job ID
        id: String,
    },

    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },

    /// Apply a JSON array of worker events to a job
    Ingest {
        /// Job ID
        id: String,

        /// File holding the events
        #[arg(long)]
        events: PathBuf,
    },
}

/// Job row for listings
#[derive(Serialize)]
pub struct JobDisplay {
    pub id: String,
    pub user: String,
    pub subject: Option<String>,
    pub status: JobStatus,
    pub priority: u8,
    pub progress: u8,
    pub clients: usize,
    pub tasks: usize,
    pub created_at: String,
}

impl From<&RenderJob> for JobDisplay {
    fn from(job: &RenderJob) -> Self {
        Self {
            id: job.id().to_string(),
            user: job.user_id().to_string(),
            subject: job.subject().map(str::to_string),
            status: job.status(),
            priority: job.priority().into(),
            progress: job.progress(),
            clients: job.config().clients.len(),
            tasks: job.total_tasks(),
            created_at: timestamp(job.created_at()),
        }
    }
}

impl TableDisplay for JobDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "ID", "User", "Subject", "Status", "Priority", "Progress", "Clients", "Tasks",
            "Created",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.user.clone(),
            or_dash(self.subject.as_deref()),
            self.status.to_string(),
            self.priority.to_string(),
            format!("{}%", self.progress),
            self.clients.to_string(),
            self.tasks.to_string(),
            self.created_at.clone(),
        ]
    }
}

/// Screenshot row for job details
#[derive(Serialize)]
pub struct ScreenshotDisplay {
    pub id: String,
    pub description: String,
    pub status: ScreenshotStatus,
    pub retries: String,
    pub size: Option<String>,
    pub best_similarity: Option<f64>,
    pub matches_baseline: Option<bool>,
    pub error: Option<String>,
}

impl ScreenshotDisplay {
    fn new(shot: &Screenshot, threshold: f64) -> Self {
        let best = shot.best_comparison();
        Self {
            id: shot.id().to_string(),
            description: shot.description(),
            status: shot.status(),
            retries: format!("{}/{}", shot.retry_count(), shot.max_retries()),
            size: shot.file_size_formatted(),
            best_similarity: best.map(|c| c.similarity_score),
            matches_baseline: best.map(|c| c.passes(threshold)),
            error: shot.error_message().map(str::to_string),
        }
    }
}

impl TableDisplay for ScreenshotDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Screenshot", "Status", "Retries", "Size", "Similarity", "Error"]
    }

    fn row(&self) -> Vec<String> {
        let similarity = self.best_similarity.map(|s| match self.matches_baseline {
            Some(true) => format!("{:.1}% ✓", s),
            _ => format!("{:.1}% ✗", s),
        });
        vec![
            self.id.clone(),
            self.description.clone(),
            self.status.to_string(),
            self.retries.clone(),
            or_dash(self.size.as_deref()),
            or_dash(similarity),
            or_dash(self.error.as_deref()),
        ]
    }
}

/// Capture task row
#[derive(Serialize)]
pub struct TaskDisplay {
    #[serde(flatten)]
    pub task: CaptureTask,
}

impl TableDisplay for TaskDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Screenshot", "Client", "Viewport", "Theme", "Worker", "Delay", "Attempt"]
    }

    fn row(&self) -> Vec<String> {
        let task = &self.task;
        vec![
            task.screenshot_id.to_string(),
            task.client_id.clone(),
            task.viewport.to_string(),
            task.theme.to_string(),
            task.automation.target(),
            format!("{} ms", task.capture_config.delay_ms),
            task.attempt.to_string(),
        ]
    }
}

/// Outcome of an ingest run
#[derive(Serialize)]
struct IngestSummary {
    job_id: String,
    applied: usize,
    rejected: usize,
    retries: Vec<CaptureTask>,
    exhausted: Vec<String>,
    job_status: JobStatus,
    progress: u8,
}

pub async fn execute(cmd: JobCommands, ctx: &Context) -> Result<()> {
    match cmd {
        JobCommands::Submit {
            html,
            clients,
            subject,
            preheader,
            priority,
            user,
            image_format,
            quality,
            no_dark_mode,
            no_accessibility,
            no_performance,
            no_spam,
        } => {
            let html_content = std::fs::read_to_string(&html)
                .with_context(|| format!("reading {}", html.display()))?;

            let mut config = RenderJobConfig::new(clients);
            config.dark_mode = !no_dark_mode;
            config.accessibility = !no_accessibility;
            config.performance = !no_performance;
            config.spam_analysis = !no_spam;
            config.screenshot_format = image_format.unwrap_or(ctx.config.screenshots.format);
            config.screenshot_quality = quality.unwrap_or(ctx.config.screenshots.quality);

            let params = CreateRenderJob {
                subject,
                preheader,
                priority: JobPriority::try_from(priority)?,
                ..CreateRenderJob::new(user, html_content, config)
            };
            submit(ctx, params)?;
        }

        JobCommands::List { status } => {
            let jobs: Vec<RenderJob> = ctx.db.list()?;
            let displays: Vec<JobDisplay> = jobs
                .iter()
                .filter(|j| status.as_deref().map_or(true, |s| j.status().to_string() == s))
                .map(JobDisplay::from)
                .collect();
            print_list(&displays, ctx.format)?;
        }

        JobCommands::Show { id } => {
            let job: RenderJob = ctx.db.load(&parse_job_id(&id)?.to_string())?;
            let screenshots: Vec<Screenshot> = ctx.db.list_for_job(job.id())?;
            show(ctx, &job, &screenshots)?;
        }

        JobCommands::Plan { id } => {
            let job_id = parse_job_id(&id)?;
            let screenshots: Vec<Screenshot> = ctx.db.list_for_job(job_id)?;
            let clients: Vec<EmailClient> = ctx.db.list()?;
            let tasks = screenshots
                .iter()
                .filter(|s| s.status() == ScreenshotStatus::Pending)
                .map(|s| {
                    let client = clients
                        .iter()
                        .find(|c| c.id() == s.client_id())
                        .ok_or_else(|| Error::not_found("email client", s.client_id()))?;
                    Ok(TaskDisplay {
                        task: CaptureTask::for_screenshot(s, client),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            print_list(&tasks, ctx.format)?;
        }

        JobCommands::Cancel { id } => {
            let job_id = parse_job_id(&id)?;
            let mut job: RenderJob = ctx.db.load(&job_id.to_string())?;
            let mut result = ctx.db.result_for_job(job_id)?;
            let screenshots: Vec<Screenshot> = ctx.db.list_for_job(job_id)?;

            job.cancel()?;
            result.fail("job cancelled");
            ctx.db.save_job_state(&job, &result, &screenshots)?;
            print_success(&format!("Job '{}' cancelled", job_id), ctx.format);
        }

        JobCommands::Ingest { id, events: path } => {
            let job_id = parse_job_id(&id)?;
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let events: Vec<WorkerEvent> = serde_json::from_str(&content)
                .with_context(|| format!("parsing worker events in {}", path.display()))?;
            ingest(ctx, job_id, events).await?;
        }
    }

    Ok(())
}

fn submit(ctx: &Context, params: CreateRenderJob) -> Result<()> {
    let ids = RandomIds;
    let clients: Vec<EmailClient> = ctx.db.list()?;
    if clients.is_empty() {
        bail!("no email clients in the store; run `mailproof clients seed` first");
    }

    let mut job = RenderJob::create(params, &ids)?;
    let plan = CapturePlanner::with_max_retries(ctx.config.screenshots.max_retries)
        .plan(&job, &clients, &ids)?;
    job.set_estimated_duration(plan.estimated_duration_secs());
    job.queue()?;

    let result = TestResult::create(
        CreateTestResult::for_job(&job).with_environment(ctx.config.runtime.environment.clone()),
        &ids,
    )?;
    ctx.db.save_job_state(&job, &result, &plan.screenshots)?;
    info!(job_id = %job.id(), screenshots = plan.len(), "Submitted render job");

    if print_serialized(&job, ctx.format)? {
        return Ok(());
    }
    print_success(
        &format!(
            "Job {} queued: {} screenshots, estimated {} s",
            job.id(),
            plan.len(),
            plan.estimated_duration_secs()
        ),
        ctx.format,
    );
    let tasks: Vec<TaskDisplay> = plan.tasks.into_iter().map(|task| TaskDisplay { task }).collect();
    print_list(&tasks, ctx.format)
}

fn show(ctx: &Context, job: &RenderJob, screenshots: &[Screenshot]) -> Result<()> {
    #[derive(Serialize)]
    struct JobDetails<'a> {
        job: RenderJobData,
        screenshots: &'a [Screenshot],
    }

    let details = JobDetails {
        job: job.to_data(),
        screenshots,
    };
    if print_serialized(&details, ctx.format)? {
        return Ok(());
    }

    let config = job.config();
    let viewports: Vec<String> = config.viewports.iter().map(|v| v.to_string()).collect();
    let analyses: Vec<String> = job.requested_analyses().iter().map(|a| a.to_string()).collect();
    print_details(&[
        ("ID", job.id().to_string()),
        ("User", job.user_id().to_string()),
        ("Subject", or_dash(job.subject())),
        ("Preheader", or_dash(job.preheader())),
        ("Status", job.status().to_string()),
        ("Progress", format!("{}%", job.progress())),
        ("Clients", config.clients.join(", ")),
        ("Viewports", viewports.join(", ")),
        ("Dark mode", config.dark_mode.to_string()),
        ("Analyses", if analyses.is_empty() { "-".to_string() } else { analyses.join(", ") }),
        ("Format", config.screenshot_format.to_string()),
        ("Estimated", or_dash(job.estimated_duration().map(|s| format!("{} s", s)))),
        ("Duration", or_dash(job.actual_duration().map(|s| format!("{} s", s)))),
        ("Error", or_dash(job.error_message())),
        ("Created", timestamp(job.created_at())),
        ("Completed", or_dash(job.completed_at().map(timestamp))),
    ]);

    let threshold = ctx.config.scoring.similarity_threshold;
    let rows: Vec<ScreenshotDisplay> = screenshots
        .iter()
        .map(|s| ScreenshotDisplay::new(s, threshold))
        .collect();
    print_list(&rows, ctx.format)
}

async fn ingest(ctx: &Context, job_id: uuid::Uuid, events: Vec<WorkerEvent>) -> Result<()> {
    let job: RenderJob = ctx.db.load(&job_id.to_string())?;
    let result = ctx.db.result_for_job(job_id)?;
    let screenshots: Vec<Screenshot> = ctx.db.list_for_job(job_id)?;
    let clients: Vec<EmailClient> = ctx.db.list()?;

    let aggregator = JobAggregator::new(job, result, screenshots, clients)?;
    let (handle, task) = spawn_aggregator(aggregator, ctx.config.runtime.channel_capacity);

    let mut summary = IngestSummary {
        job_id: job_id.to_string(),
        applied: 0,
        rejected: 0,
        retries: Vec::new(),
        exhausted: Vec::new(),
        job_status: JobStatus::Processing,
        progress: 0,
    };
    for (i, event) in events.into_iter().enumerate() {
        match handle.send(event).await {
            Ok(dispatches) => {
                summary.applied += 1;
                for dispatch in dispatches {
                    debug!(?dispatch, "Dispatch");
                    match dispatch {
                        Dispatch::Retry(task) => summary.retries.push(task),
                        Dispatch::Exhausted { screenshot_id } => {
                            summary.exhausted.push(screenshot_id.to_string())
                        }
                        Dispatch::Finished { .. } => {}
                    }
                }
            }
            Err(e) => {
                summary.rejected += 1;
                print_warning(&format!("event #{} rejected: {}", i + 1, e));
            }
        }
    }
    drop(handle);

    let state = task.await.context("aggregator task panicked")?;
    ctx.db.save_job_state(&state.job, &state.result, &state.screenshots)?;
    summary.job_status = state.job.status();
    summary.progress = state.job.progress();

    if print_serialized(&summary, ctx.format)? {
        return Ok(());
    }
    print_success(
        &format!(
            "Applied {} events ({} rejected); job is {} at {}%",
            summary.applied, summary.rejected, summary.job_status, summary.progress
        ),
        ctx.format,
    );
    for id in &summary.exhausted {
        print_warning(&format!("screenshot {} used its whole retry budget", id));
    }
    if !summary.retries.is_empty() {
        print_info("Captures to retry:");
        let tasks: Vec<TaskDisplay> = summary
            .retries
            .into_iter()
            .map(|task| TaskDisplay { task })
            .collect();
        print_list(&tasks, ctx.format)?;
    }
    Ok(())
}
