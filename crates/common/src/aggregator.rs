//! Per-job aggregation of worker events
//!
//! A [`JobAggregator`] exclusively owns one job's [`RenderJob`], [`TestResult`] and
//! screenshots. Worker callbacks arrive as [`WorkerEvent`]s; applying one mutates the
//! owned entities and yields [`Dispatch`]es for the orchestrator (retries, completion).
//! [`spawn_aggregator`] puts the aggregator behind a channel so concurrent callbacks
//! are applied one at a time.
//!
//! Client reports and screenshot events may arrive in any order: a screenshot that
//! resolves after its client reported is attached to that client's result.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::EmailClient;
use crate::job::{JobStatus, RenderJob};
use crate::plan::CaptureTask;
use crate::result::{
    AccessibilityResult, ClientTestResult, CompatibilityIssue, PerformanceResult, SpamResult,
    TestResult, TestStatus,
};
use crate::screenshot::{ComparisonResult, ImageMetadata, Screenshot, StorageInfo};
use crate::{Error, Result};

/// Callback from a capture worker or analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    CaptureStarted {
        screenshot_id: Uuid,
    },
    Captured {
        screenshot_id: Uuid,
        metadata: ImageMetadata,
        processing_time_ms: u64,
    },
    ProcessingStarted {
        screenshot_id: Uuid,
    },
    Stored {
        screenshot_id: Uuid,
        storage: StorageInfo,
    },
    CaptureFailed {
        screenshot_id: Uuid,
        error: String,
    },
    Compared {
        screenshot_id: Uuid,
        comparison: ComparisonResult,
    },
    /// A client finished testing at one viewport
    ClientTested {
        client_id: String,
        viewport: String,
        status: TestStatus,
        compatibility_score: f64,
        #[serde(default)]
        issues: Vec<CompatibilityIssue>,
        #[serde(default)]
        render_time_ms: u64,
        #[serde(default)]
        error_message: Option<String>,
    },
    Accessibility {
        result: AccessibilityResult,
    },
    Performance {
        result: PerformanceResult,
    },
    Spam {
        result: SpamResult,
    },
    Cancel {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl WorkerEvent {
    /// Screenshot the event is about, if any
    pub fn screenshot_id(&self) -> Option<Uuid> {
        match self {
            WorkerEvent::CaptureStarted { screenshot_id }
            | WorkerEvent::Captured { screenshot_id, .. }
            | WorkerEvent::ProcessingStarted { screenshot_id }
            | WorkerEvent::Stored { screenshot_id, .. }
            | WorkerEvent::CaptureFailed { screenshot_id, .. }
            | WorkerEvent::Compared { screenshot_id, .. } => Some(*screenshot_id),
            _ => None,
        }
    }
}

/// Instruction back to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dispatch", rename_all = "snake_case")]
pub enum Dispatch {
    /// Capture this screenshot again
    Retry(CaptureTask),
    /// The screenshot used its whole retry budget
    Exhausted { screenshot_id: Uuid },
    /// The job reached a terminal status; stop sending work for it
    Finished { job_id: Uuid, status: JobStatus },
}

/// Point-in-time copy of everything an aggregator owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    pub job: RenderJob,
    pub result: TestResult,
    pub screenshots: Vec<Screenshot>,
}

pub struct JobAggregator {
    job: RenderJob,
    result: TestResult,
    screenshots: Vec<Screenshot>,
    clients: HashMap<String, EmailClient>,
}

impl JobAggregator {
    /// Take ownership of a job's entities, moving the job to processing and the result
    /// to running if they are not there yet
    pub fn new(
        mut job: RenderJob,
        mut result: TestResult,
        screenshots: Vec<Screenshot>,
        clients: impl IntoIterator<Item = EmailClient>,
    ) -> Result<Self> {
        if result.job_id() != job.id() {
            return Err(Error::validation(
                "test result",
                format!("result belongs to job {}, not {}", result.job_id(), job.id()),
            ));
        }
        if let Some(shot) = screenshots.iter().find(|s| s.job_id() != job.id()) {
            return Err(Error::validation(
                "screenshot",
                format!("screenshot {} belongs to job {}", shot.id(), shot.job_id()),
            ));
        }

        if job.status() == JobStatus::Pending {
            job.queue()?;
        }
        if job.status() == JobStatus::Queued {
            job.start()?;
        }
        if result.overall_status() == TestStatus::Pending {
            result.start()?;
        }

        let clients = clients
            .into_iter()
            .filter(|c| job.config().clients.iter().any(|id| id == c.id()))
            .map(|c| (c.id().to_string(), c))
            .collect();

        Ok(Self {
            job,
            result,
            screenshots,
            clients,
        })
    }

    pub fn job(&self) -> &RenderJob {
        &self.job
    }

    pub fn result(&self) -> &TestResult {
        &self.result
    }

    pub fn screenshots(&self) -> &[Screenshot] {
        &self.screenshots
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            job: self.job.clone(),
            result: self.result.clone(),
            screenshots: self.screenshots.clone(),
        }
    }

    pub fn into_snapshot(self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            job: self.job,
            result: self.result,
            screenshots: self.screenshots,
        }
    }

    /// Screenshots that will not change without outside intervention
    pub fn resolved(&self) -> usize {
        self.screenshots.iter().filter(|s| s.is_terminal()).count()
    }

    /// Resolved screenshots as a percentage of the plan
    pub fn progress(&self) -> u8 {
        if self.screenshots.is_empty() {
            return 0;
        }
        (self.resolved() * 100 / self.screenshots.len()) as u8
    }

    /// Apply one event and return what the orchestrator should do next
    pub fn apply(&mut self, event: WorkerEvent) -> Result<Vec<Dispatch>> {
        if self.job.is_terminal() {
            return Err(Error::transition(
                "render job",
                "apply worker event",
                self.job.status(),
                "'processing'",
            ));
        }

        let touched = event.screenshot_id();
        let mut dispatches = Vec::new();
        match event {
            WorkerEvent::CaptureStarted { screenshot_id } => {
                self.screenshot_mut(screenshot_id)?.start_capture()?;
            }
            WorkerEvent::Captured {
                screenshot_id,
                metadata,
                processing_time_ms,
            } => {
                self.screenshot_mut(screenshot_id)?
                    .mark_captured(metadata, processing_time_ms)?;
            }
            WorkerEvent::ProcessingStarted { screenshot_id } => {
                self.screenshot_mut(screenshot_id)?.start_processing()?;
            }
            WorkerEvent::Stored {
                screenshot_id,
                storage,
            } => {
                self.screenshot_mut(screenshot_id)?.mark_ready(storage)?;
            }
            WorkerEvent::CaptureFailed {
                screenshot_id,
                error,
            } => {
                dispatches.push(self.capture_failed(screenshot_id, error)?);
            }
            WorkerEvent::Compared {
                screenshot_id,
                comparison,
            } => {
                self.screenshot_mut(screenshot_id)?
                    .add_comparison_result(comparison)?;
            }
            WorkerEvent::ClientTested {
                client_id,
                viewport,
                status,
                compatibility_score,
                issues,
                render_time_ms,
                error_message,
            } => {
                let client_result = self.client_result(
                    &client_id,
                    &viewport,
                    status,
                    compatibility_score,
                    issues,
                    render_time_ms,
                    error_message,
                )?;
                self.result.add_client_result(client_result)?;
            }
            WorkerEvent::Accessibility { result } => self.result.set_accessibility_result(result)?,
            WorkerEvent::Performance { result } => self.result.set_performance_result(result)?,
            WorkerEvent::Spam { result } => self.result.set_spam_result(result)?,
            WorkerEvent::Cancel { reason } => {
                let reason = reason.unwrap_or_else(|| "cancelled".to_string());
                self.job.cancel()?;
                self.result.fail(format!("job cancelled: {}", reason));
                info!(job_id = %self.job.id(), "Render job cancelled: {}", reason);
                dispatches.push(self.finished());
                return Ok(dispatches);
            }
        }

        if let Some(screenshot_id) = touched {
            self.reattach_screenshots(screenshot_id)?;
        }
        self.job.update_progress(self.progress())?;
        if self.ready_to_complete() {
            self.result.complete_job(&mut self.job)?;
            dispatches.push(self.finished());
        }
        Ok(dispatches)
    }

    fn capture_failed(&mut self, screenshot_id: Uuid, error: String) -> Result<Dispatch> {
        let job_id = self.job.id();
        let screenshot = self
            .screenshots
            .iter_mut()
            .find(|s| s.id() == screenshot_id)
            .ok_or_else(|| Error::not_found("screenshot", screenshot_id))?;
        screenshot.fail(error)?;

        if !screenshot.can_retry() {
            warn!(
                job_id = %job_id,
                screenshot_id = %screenshot_id,
                retries = screenshot.retry_count(),
                "Retry budget exhausted for {}",
                screenshot.description()
            );
            return Ok(Dispatch::Exhausted { screenshot_id });
        }

        screenshot.retry()?;
        let client = self
            .clients
            .get(screenshot.client_id())
            .ok_or_else(|| Error::not_found("email client", screenshot.client_id()))?;
        info!(
            job_id = %job_id,
            screenshot_id = %screenshot_id,
            attempt = screenshot.retry_count(),
            "Retrying capture for {}",
            screenshot.description()
        );
        Ok(Dispatch::Retry(CaptureTask::for_screenshot(screenshot, client)))
    }

    #[allow(clippy::too_many_arguments)]
    fn client_result(
        &self,
        client_id: &str,
        viewport_name: &str,
        status: TestStatus,
        compatibility_score: f64,
        issues: Vec<CompatibilityIssue>,
        render_time_ms: u64,
        error_message: Option<String>,
    ) -> Result<ClientTestResult> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| Error::not_found("email client", client_id))?;
        let viewport = self
            .job
            .config()
            .viewports
            .iter()
            .find(|v| v.name == viewport_name)
            .ok_or_else(|| Error::not_found("viewport", viewport_name))?;

        let screenshots = self.resolved_screenshots(client_id, viewport_name);
        debug!(
            client = client_id,
            viewport = viewport_name,
            screenshots = screenshots.len(),
            "Client tested"
        );

        let mut result = ClientTestResult::new(
            client_id,
            client.display_name(),
            viewport.clone(),
            status,
            compatibility_score,
        );
        result.issues = issues;
        result.screenshots = screenshots;
        result.render_time_ms = render_time_ms;
        result.error_message = error_message;
        Ok(result)
    }

    fn resolved_screenshots(&self, client_id: &str, viewport_name: &str) -> Vec<Screenshot> {
        self.screenshots
            .iter()
            .filter(|s| {
                s.client_id() == client_id && s.viewport().name == viewport_name && s.is_terminal()
            })
            .cloned()
            .collect()
    }

    /// Refresh the screenshots attached to an already reported client result
    fn reattach_screenshots(&mut self, screenshot_id: Uuid) -> Result<()> {
        let Some(shot) = self.screenshots.iter().find(|s| s.id() == screenshot_id) else {
            return Ok(());
        };
        let (client_id, viewport_name) = (shot.client_id(), shot.viewport().name.as_str());
        let Some(reported) = self
            .result
            .client_results()
            .iter()
            .find(|r| r.client_id == client_id && r.viewport.name == viewport_name)
        else {
            return Ok(());
        };

        let screenshots = self.resolved_screenshots(client_id, viewport_name);
        if screenshots == reported.screenshots {
            return Ok(());
        }
        let mut refreshed = reported.clone();
        refreshed.screenshots = screenshots;
        self.result.add_client_result(refreshed)
    }

    fn ready_to_complete(&self) -> bool {
        self.result.has_all_client_results()
            && self
                .job
                .requested_analyses()
                .into_iter()
                .all(|a| self.result.has_analysis(a))
    }

    fn finished(&self) -> Dispatch {
        Dispatch::Finished {
            job_id: self.job.id(),
            status: self.job.status(),
        }
    }

    fn screenshot_mut(&mut self, id: Uuid) -> Result<&mut Screenshot> {
        self.screenshots
            .iter_mut()
            .find(|s| s.id() == id)
            .ok_or_else(|| Error::not_found("screenshot", id))
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Apply {
        event: WorkerEvent,
        reply: oneshot::Sender<Result<Vec<Dispatch>>>,
    },
    Snapshot {
        reply: oneshot::Sender<AggregatorSnapshot>,
    },
}

/// Cloneable sender side of a running aggregator
#[derive(Clone)]
pub struct AggregatorHandle {
    job_id: Uuid,
    tx: mpsc::Sender<Command>,
}

impl AggregatorHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Apply `event` and wait for the resulting dispatches
    pub async fn send(&self, event: WorkerEvent) -> Result<Vec<Dispatch>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply { event, reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn snapshot(&self) -> Result<AggregatorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::ChannelClosed(self.job_id.to_string())
    }
}

/// Run `aggregator` on its own task
///
/// The task ends once every handle is dropped and yields the final state.
pub fn spawn_aggregator(
    aggregator: JobAggregator,
    capacity: usize,
) -> (AggregatorHandle, JoinHandle<AggregatorSnapshot>) {
    let job_id = aggregator.job().id();
    let (tx, mut rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        let mut aggregator = aggregator;
        while let Some(command) = rx.recv().await {
            match command {
                Command::Apply { event, reply } => {
                    let outcome = aggregator.apply(event);
                    if let Err(e) = &outcome {
                        warn!(job_id = %job_id, "Rejected worker event: {}", e);
                    }
                    let _ = reply.send(outcome);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(aggregator.snapshot());
                }
            }
        }
        debug!(job_id = %job_id, "Aggregator stopped");
        aggregator.into_snapshot()
    });

    (AggregatorHandle { job_id, tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::job::{CreateRenderJob, RenderJobConfig};
    use crate::plan::CapturePlanner;
    use crate::presets;
    use crate::result::CreateTestResult;
    use crate::screenshot::{StorageProvider, ScreenshotStatus};
    use crate::types::{ImageFormat, Viewport};

    fn aggregator(dark_mode: bool, accessibility: bool) -> JobAggregator {
        let ids = SequentialIds::new();
        let mut config = RenderJobConfig::new(["gmail"]).with_viewports(vec![Viewport::desktop()]);
        config.dark_mode = dark_mode;
        config.accessibility = accessibility;
        config.performance = false;
        config.spam_analysis = false;
        let params = CreateRenderJob::new("user-1", "<p>hi</p>", config);
        let job = RenderJob::create(params, &ids).unwrap();
        let result = TestResult::create(CreateTestResult::for_job(&job), &ids).unwrap();
        let clients = presets::all().unwrap();
        let plan = CapturePlanner::new().plan(&job, &clients, &ids).unwrap();
        JobAggregator::new(job, result, plan.screenshots, clients).unwrap()
    }

    fn capture(agg: &mut JobAggregator, id: Uuid) {
        let metadata = ImageMetadata {
            width: 600,
            height: 1400,
            format: ImageFormat::Png,
            size_bytes: 204_800,
            quality: None,
            dpi: None,
            color_space: None,
            has_alpha: false,
            hash: None,
        };
        let storage = StorageInfo {
            provider: StorageProvider::Local,
            bucket: None,
            key: format!("{}.png", id),
            url: format!("file:///tmp/{}.png", id),
            thumbnail_url: None,
            cdn_url: None,
            is_public: false,
            expires_at: None,
        };
        for event in [
            WorkerEvent::CaptureStarted { screenshot_id: id },
            WorkerEvent::Captured {
                screenshot_id: id,
                metadata,
                processing_time_ms: 900,
            },
            WorkerEvent::ProcessingStarted { screenshot_id: id },
            WorkerEvent::Stored {
                screenshot_id: id,
                storage,
            },
        ] {
            assert!(agg.apply(event).unwrap().is_empty());
        }
    }

    fn tested(status: TestStatus) -> WorkerEvent {
        WorkerEvent::ClientTested {
            client_id: "gmail".to_string(),
            viewport: "desktop".to_string(),
            status,
            compatibility_score: 92.0,
            issues: Vec::new(),
            render_time_ms: 1500,
            error_message: None,
        }
    }

    #[test]
    fn test_new_starts_job_and_result() {
        let agg = aggregator(false, false);
        assert_eq!(agg.job().status(), JobStatus::Processing);
        assert_eq!(agg.result().overall_status(), TestStatus::Running);
        assert_eq!(agg.screenshots().len(), 1);
        assert_eq!(agg.progress(), 0);
    }

    #[test]
    fn test_progress_and_auto_complete() {
        let mut agg = aggregator(true, true);
        let ids: Vec<Uuid> = agg.screenshots().iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 2);

        capture(&mut agg, ids[0]);
        assert_eq!(agg.job().progress(), 50);
        capture(&mut agg, ids[1]);
        assert_eq!(agg.job().progress(), 100);

        assert!(agg.apply(tested(TestStatus::Passed)).unwrap().is_empty());
        assert_eq!(agg.result().client_results()[0].screenshots.len(), 2);

        let dispatches = agg
            .apply(WorkerEvent::Accessibility {
                result: AccessibilityResult::new(80.0),
            })
            .unwrap();
        assert_eq!(
            dispatches,
            vec![Dispatch::Finished {
                job_id: agg.job().id(),
                status: JobStatus::Completed
            }]
        );
        assert_eq!(agg.result().overall_status(), TestStatus::Passed);
        // (92 * 0.40 + 80 * 0.25) / 0.65
        assert_eq!(agg.result().overall_score(), 87.38);

        let err = agg.apply(tested(TestStatus::Passed)).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_screenshots_resolved_after_client_report_are_attached() {
        let mut agg = aggregator(false, true);
        let id = agg.screenshots()[0].id();

        assert!(agg.apply(tested(TestStatus::Passed)).unwrap().is_empty());
        assert!(agg.result().client_results()[0].screenshots.is_empty());
        assert_eq!(agg.result().summary().total_screenshots, 0);

        capture(&mut agg, id);
        let attached = &agg.result().client_results()[0].screenshots;
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].status(), ScreenshotStatus::Ready);
        assert_eq!(agg.result().summary().total_screenshots, 1);

        agg.apply(WorkerEvent::Accessibility {
            result: AccessibilityResult::new(90.0),
        })
        .unwrap();
        assert_eq!(agg.result().overall_status(), TestStatus::Passed);
        assert_eq!(agg.result().summary().total_screenshots, 1);
    }

    #[test]
    fn test_failed_capture_is_retried_until_exhausted() {
        let mut agg = aggregator(false, false);
        let id = agg.screenshots()[0].id();
        let budget = agg.screenshots()[0].max_retries();

        for attempt in 1..=budget {
            let dispatches = agg
                .apply(WorkerEvent::CaptureFailed {
                    screenshot_id: id,
                    error: "browser crashed".to_string(),
                })
                .unwrap();
            match &dispatches[..] {
                [Dispatch::Retry(task)] => assert_eq!(task.attempt, attempt),
                other => panic!("unexpected dispatches {:?}", other),
            }
        }

        let dispatches = agg
            .apply(WorkerEvent::CaptureFailed {
                screenshot_id: id,
                error: "browser crashed".to_string(),
            })
            .unwrap();
        assert_eq!(dispatches, vec![Dispatch::Exhausted { screenshot_id: id }]);
        assert_eq!(agg.screenshots()[0].status(), ScreenshotStatus::Failed);
        assert_eq!(agg.job().progress(), 100);

        let dispatches = agg.apply(tested(TestStatus::Error)).unwrap();
        assert!(matches!(
            dispatches[..],
            [Dispatch::Finished {
                status: JobStatus::Completed,
                ..
            }]
        ));
        assert_eq!(agg.result().overall_status(), TestStatus::Error);
    }

    #[test]
    fn test_cancel() {
        let mut agg = aggregator(false, true);
        let dispatches = agg
            .apply(WorkerEvent::Cancel {
                reason: Some("user request".to_string()),
            })
            .unwrap();
        assert!(matches!(
            dispatches[..],
            [Dispatch::Finished {
                status: JobStatus::Cancelled,
                ..
            }]
        ));
        assert_eq!(agg.result().overall_status(), TestStatus::Error);
        assert!(agg.apply(WorkerEvent::Cancel { reason: None }).is_err());
    }

    #[test]
    fn test_unknown_screenshot() {
        let mut agg = aggregator(false, false);
        let err = agg
            .apply(WorkerEvent::CaptureStarted {
                screenshot_id: Uuid::from_u128(999_999),
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let json = r#"{"event":"capture_failed","screenshot_id":"00000000-0000-0000-0000-000000000003","error":"timeout"}"#;
        let event: WorkerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            WorkerEvent::CaptureFailed {
                screenshot_id: Uuid::from_u128(3),
                error: "timeout".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_actor_serializes_events() {
        let agg = aggregator(false, false);
        let id = agg.screenshots()[0].id();
        let (handle, task) = spawn_aggregator(agg, 8);

        let worker = handle.clone();
        let started = tokio::spawn(async move {
            worker
                .send(WorkerEvent::CaptureStarted { screenshot_id: id })
                .await
        });
        started.await.unwrap().unwrap();

        // second start is rejected: the screenshot is already capturing
        assert!(handle
            .send(WorkerEvent::CaptureStarted { screenshot_id: id })
            .await
            .is_err());

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.screenshots[0].status(), ScreenshotStatus::Capturing);

        drop(handle);
        let last = task.await.unwrap();
        assert_eq!(last.job.status(), JobStatus::Processing);
    }
}
