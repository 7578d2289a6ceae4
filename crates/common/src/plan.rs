//! Capture planning
//!
//! Expands a render job into one pending [`Screenshot`] per client x viewport x theme,
//! each paired with the [`CaptureTask`] a worker needs to produce it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{AutomationConfig, EmailClient, MAX_CLIENT_RETRIES};
use crate::ids::IdGenerator;
use crate::job::RenderJob;
use crate::screenshot::{CaptureConfig, CreateScreenshot, Screenshot};
use crate::types::{ImageFormat, Theme, Viewport};
use crate::{Error, Result};

/// Work order handed to a capture worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTask {
    pub screenshot_id: Uuid,
    pub job_id: Uuid,
    pub client_id: String,
    pub viewport: Viewport,
    pub theme: Theme,
    pub capture_config: CaptureConfig,
    pub automation: AutomationConfig,
    /// Per-capture timeout in milliseconds
    pub timeout_ms: u64,
    /// 0 for the first attempt
    pub attempt: u32,
}

impl CaptureTask {
    /// Task for capturing `screenshot` with `client`'s automation backend
    pub fn for_screenshot(screenshot: &Screenshot, client: &EmailClient) -> Self {
        Self {
            screenshot_id: screenshot.id(),
            job_id: screenshot.job_id(),
            client_id: screenshot.client_id().to_string(),
            viewport: screenshot.viewport().clone(),
            theme: screenshot.theme(),
            capture_config: screenshot.capture_config().clone(),
            automation: client.automation_config().clone(),
            timeout_ms: client.test_config().timeout_ms,
            attempt: screenshot.retry_count(),
        }
    }
}

/// Screenshots and tasks for one job
#[derive(Debug, Clone, Default)]
pub struct CapturePlan {
    pub screenshots: Vec<Screenshot>,
    pub tasks: Vec<CaptureTask>,
    /// Sum of the clients' estimated test durations, in milliseconds
    pub estimated_duration_ms: u64,
}

impl CapturePlan {
    pub fn len(&self) -> usize {
        self.screenshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screenshots.is_empty()
    }

    pub fn estimated_duration_secs(&self) -> u64 {
        let ms = self.estimated_duration_ms;
        ms / 1000 + u64::from(ms % 1000 != 0)
    }
}

/// Expands jobs into capture work
#[derive(Debug, Clone, Copy)]
pub struct CapturePlanner {
    max_retries: u32,
}

impl Default for CapturePlanner {
    fn default() -> Self {
        Self {
            max_retries: MAX_CLIENT_RETRIES,
        }
    }
}

impl CapturePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every screenshot's retry budget at `max_retries`
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Plan `job` against the client catalog `clients`
    pub fn plan(
        &self,
        job: &RenderJob,
        clients: &[EmailClient],
        ids: &dyn IdGenerator,
    ) -> Result<CapturePlan> {
        let config = job.config();
        let resolved = config
            .clients
            .iter()
            .map(|id| resolve(clients, id))
            .collect::<Result<Vec<_>>>()?;

        let mut plan = CapturePlan::default();
        for client in resolved {
            let test_config = client.test_config();
            let mut themes = vec![Theme::Light];
            if config.dark_mode && client.supports_dark_mode() {
                themes.push(Theme::Dark);
            }

            let capture_config = CaptureConfig {
                format: config.screenshot_format,
                quality: (config.screenshot_format != ImageFormat::Png)
                    .then_some(config.screenshot_quality),
                delay_ms: test_config.screenshot_delay_ms,
                ..CaptureConfig::default()
            };

            for viewport in &config.viewports {
                for theme in &themes {
                    let params = CreateScreenshot {
                        capture_config: capture_config.clone(),
                        max_retries: test_config.retries.min(self.max_retries),
                        ..CreateScreenshot::new(
                            job.id(),
                            client.id(),
                            client.display_name(),
                            viewport.clone(),
                            theme.is_dark(),
                        )
                    };
                    let screenshot = Screenshot::create(params, ids)?;
                    debug!(
                        job_id = %job.id(),
                        screenshot_id = %screenshot.id(),
                        "Planned {}",
                        screenshot.description()
                    );
                    plan.tasks.push(CaptureTask::for_screenshot(&screenshot, client));
                    plan.screenshots.push(screenshot);
                }
            }
            plan.estimated_duration_ms = plan
                .estimated_duration_ms
                .saturating_add(client.estimated_test_duration());
        }

        info!(
            job_id = %job.id(),
            clients = config.clients.len(),
            screenshots = plan.len(),
            "Capture plan ready"
        );
        Ok(plan)
    }
}

fn resolve<'a>(clients: &'a [EmailClient], id: &str) -> Result<&'a EmailClient> {
    let client = clients
        .iter()
        .find(|c| c.id() == id)
        .ok_or_else(|| Error::not_found("email client", id))?;
    if !client.is_active() {
        return Err(Error::validation(
            "render job",
            format!("email client '{}' is inactive", id),
        ));
    }
    if !client.test_config().enabled {
        return Err(Error::validation(
            "render job",
            format!("testing is disabled for email client '{}'", id),
        ));
    }
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::job::{CreateRenderJob, RenderJobConfig};
    use crate::presets;
    use crate::screenshot::ScreenshotStatus;

    fn job(clients: &[&str], dark_mode: bool) -> RenderJob {
        let mut config = RenderJobConfig::new(clients.iter().copied());
        config.dark_mode = dark_mode;
        RenderJob::create(
            CreateRenderJob::new("user-1", "<table><tr><td>Hi</td></tr></table>", config),
            &SequentialIds::starting_at(1000),
        )
        .unwrap()
    }

    #[test]
    fn test_plan_without_dark_mode_matches_total_tasks() {
        let job = job(&["gmail", "yandex"], false);
        let clients = presets::all().unwrap();
        let plan = CapturePlanner::new()
            .plan(&job, &clients, &SequentialIds::new())
            .unwrap();

        assert_eq!(job.total_tasks(), 4);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.tasks.len(), 4);
        assert!(plan
            .screenshots
            .iter()
            .all(|s| s.status() == ScreenshotStatus::Pending && !s.dark_mode()));
        assert!(plan.tasks.iter().all(|t| t.attempt == 0 && t.job_id == job.id()));
    }

    #[test]
    fn test_dark_pass_only_for_capable_clients() {
        let job = job(&["gmail", "outlook-2019"], true);
        let clients = presets::all().unwrap();
        let plan = CapturePlanner::new()
            .plan(&job, &clients, &SequentialIds::new())
            .unwrap();

        let gmail = clients.iter().find(|c| c.id() == "gmail").unwrap();
        let outlook = clients.iter().find(|c| c.id() == "outlook-2019").unwrap();
        let expected = |c: &EmailClient| if c.supports_dark_mode() { 4 } else { 2 };
        assert_eq!(plan.len(), expected(gmail) + expected(outlook));
        assert!(plan.len() <= job.capture_count());

        let dark = plan.screenshots.iter().filter(|s| s.dark_mode()).count();
        assert_eq!(dark, plan.len() - 4);
    }

    #[test]
    fn test_capture_settings_follow_client() {
        let job = job(&["outlook-2019"], false);
        let clients = presets::all().unwrap();
        let outlook = clients.iter().find(|c| c.id() == "outlook-2019").unwrap();
        let plan = CapturePlanner::with_max_retries(1)
            .plan(&job, &clients, &SequentialIds::new())
            .unwrap();

        let task = &plan.tasks[0];
        assert_eq!(task.capture_config.delay_ms, outlook.test_config().screenshot_delay_ms);
        assert_eq!(task.capture_config.quality, None);
        assert_eq!(&task.automation, outlook.automation_config());
        assert!(plan.screenshots.iter().all(|s| s.max_retries() <= 1));
        assert_eq!(plan.estimated_duration_ms, outlook.estimated_test_duration());
    }

    #[test]
    fn test_unknown_and_inactive_clients() {
        let mut clients = presets::all().unwrap();
        let err = CapturePlanner::new()
            .plan(&job(&["hotmail-1998"], false), &clients, &SequentialIds::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        for client in clients.iter_mut().filter(|c| c.id() == "yandex") {
            client.deactivate();
        }
        let err = CapturePlanner::new()
            .plan(&job(&["gmail", "yandex"], false), &clients, &SequentialIds::new())
            .unwrap_err();
        assert!(err.to_string().contains("inactive"));
    }

    #[test]
    fn test_estimated_seconds_round_up_without_overflow() {
        let plan = |ms| CapturePlan {
            screenshots: Vec::new(),
            tasks: Vec::new(),
            estimated_duration_ms: ms,
        };
        assert_eq!(plan(0).estimated_duration_secs(), 0);
        assert_eq!(plan(1).estimated_duration_secs(), 1);
        assert_eq!(plan(2_000).estimated_duration_secs(), 2);
        assert_eq!(plan(u64::MAX).estimated_duration_secs(), u64::MAX / 1000 + 1);
    }
}
