//! Screenshots
//!
//! One [`Screenshot`] exists per (client, viewport, theme) combination of a render job.
//!
//! ```text
//! pending ─▶ capturing ─▶ captured ─▶ processing ─▶ ready ─▶ archived
//!    ▲          │            │            │
//!    │          └────────────┴────────────┴──▶ failed
//!    └──────────────── retry ◀──────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ids::IdGenerator;
use crate::types::{check_percent, ImageFormat, Theme, Viewport};
use crate::{Error, Result};

const ENTITY: &str = "screenshot";

/// Retry budget when none is given
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Similarity (percent) at or above which a comparison counts as a match
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 95.0;

/// Screenshot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotStatus {
    Pending,
    Capturing,
    Captured,
    Processing,
    Ready,
    Failed,
    Archived,
}

impl Default for ScreenshotStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ScreenshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScreenshotStatus::Pending => write!(f, "pending"),
            ScreenshotStatus::Capturing => write!(f, "capturing"),
            ScreenshotStatus::Captured => write!(f, "captured"),
            ScreenshotStatus::Processing => write!(f, "processing"),
            ScreenshotStatus::Ready => write!(f, "ready"),
            ScreenshotStatus::Failed => write!(f, "failed"),
            ScreenshotStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Facts about the encoded image, reported by the capturing worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub size_bytes: u64,
    pub quality: Option<u8>,
    pub dpi: Option<u32>,
    #[serde(default)]
    pub color_space: Option<String>,
    #[serde(default)]
    pub has_alpha: bool,
    /// Content hash of the encoded image
    #[serde(default)]
    pub hash: Option<String>,
}

impl ImageMetadata {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::validation(ENTITY, "image dimensions must be positive"));
        }
        if let Some(quality) = self.quality {
            if !(1..=100).contains(&quality) {
                return Err(Error::validation(
                    ENTITY,
                    format!("image quality must be within 1..=100, got {}", quality),
                ));
            }
        }
        Ok(())
    }
}

/// Where the stored image lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    Local,
    S3,
    Gcs,
    Azure,
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProvider::Local => write!(f, "local"),
            StorageProvider::S3 => write!(f, "s3"),
            StorageProvider::Gcs => write!(f, "gcs"),
            StorageProvider::Azure => write!(f, "azure"),
        }
    }
}

/// Storage location of a processed screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub provider: StorageProvider,
    pub bucket: Option<String>,
    pub key: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub cdn_url: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StorageInfo {
    fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::validation(ENTITY, "storage key must not be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(Error::validation(ENTITY, "storage url must not be empty"));
        }
        if self.provider != StorageProvider::Local
            && self.bucket.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::validation(
                ENTITY,
                format!("{} storage requires a bucket", self.provider),
            ));
        }
        Ok(())
    }
}

/// Rectangle to clip a capture to, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// How the worker hands the image back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureEncoding {
    Binary,
    Base64,
}

impl Default for CaptureEncoding {
    fn default() -> Self {
        Self::Binary
    }
}

/// Instructions for the capturing worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub full_page: bool,
    #[serde(default)]
    pub clip: Option<ClipRect>,
    #[serde(default)]
    pub encoding: CaptureEncoding,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default)]
    pub quality: Option<u8>,
    /// Wait before capturing, in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_true")]
    pub disable_animations: bool,
    #[serde(default = "default_true")]
    pub hide_caret: bool,
    #[serde(default)]
    pub omit_background: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            full_page: true,
            clip: None,
            encoding: CaptureEncoding::Binary,
            format: ImageFormat::Png,
            quality: None,
            delay_ms: 0,
            disable_animations: true,
            hide_caret: true,
            omit_background: false,
        }
    }
}

impl CaptureConfig {
    fn validate(&self) -> Result<()> {
        if let Some(clip) = &self.clip {
            if clip.width == 0 || clip.height == 0 {
                return Err(Error::validation(ENTITY, "clip rectangle must have a positive size"));
            }
            if self.full_page {
                return Err(Error::validation(ENTITY, "full-page capture cannot be clipped"));
            }
        }
        if let Some(quality) = self.quality {
            if !(1..=100).contains(&quality) {
                return Err(Error::validation(
                    ENTITY,
                    format!("capture quality must be within 1..=100, got {}", quality),
                ));
            }
            if self.format == ImageFormat::Png {
                return Err(Error::validation(ENTITY, "quality does not apply to png captures"));
            }
        }
        Ok(())
    }
}

/// A differing region reported by the diff engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Output of the image-diff engine against one baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub baseline_screenshot_id: Uuid,
    /// 0-100, higher is more similar
    pub similarity_score: f64,
    pub diff_pixels: u64,
    pub total_pixels: u64,
    pub diff_image_url: Option<String>,
    #[serde(default)]
    pub regions: Vec<DiffRegion>,
    pub compared_at: DateTime<Utc>,
}

impl ComparisonResult {
    pub fn new(baseline_screenshot_id: Uuid, similarity_score: f64) -> Self {
        Self {
            baseline_screenshot_id,
            similarity_score,
            diff_pixels: 0,
            total_pixels: 0,
            diff_image_url: None,
            regions: Vec::new(),
            compared_at: Utc::now(),
        }
    }

    pub fn passes(&self, threshold: f64) -> bool {
        self.similarity_score >= threshold
    }

    fn validate(&self) -> Result<()> {
        check_percent(ENTITY, "similarity score", self.similarity_score)?;
        if self.diff_pixels > self.total_pixels && self.total_pixels > 0 {
            return Err(Error::validation(ENTITY, "diff pixels exceed total pixels"));
        }
        Ok(())
    }
}

/// Persisted layout of a screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotData {
    pub id: Uuid,
    pub job_id: Uuid,
    pub client_id: String,
    pub client_name: String,
    pub viewport: Viewport,
    pub dark_mode: bool,
    pub status: ScreenshotStatus,
    pub image_metadata: Option<ImageMetadata>,
    pub storage_info: Option<StorageInfo>,
    #[serde(default)]
    pub capture_config: CaptureConfig,
    #[serde(default)]
    pub comparison_results: Vec<ComparisonResult>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Milliseconds the worker spent capturing
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Parameters for [`Screenshot::create`]
#[derive(Debug, Clone)]
pub struct CreateScreenshot {
    pub job_id: Uuid,
    pub client_id: String,
    pub client_name: String,
    pub viewport: Viewport,
    pub dark_mode: bool,
    pub capture_config: CaptureConfig,
    pub max_retries: u32,
}

impl CreateScreenshot {
    pub fn new(
        job_id: Uuid,
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        viewport: Viewport,
        dark_mode: bool,
    ) -> Self {
        Self {
            job_id,
            client_id: client_id.into(),
            client_name: client_name.into(),
            viewport,
            dark_mode,
            capture_config: CaptureConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// A validated screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScreenshotData", into = "ScreenshotData")]
pub struct Screenshot {
    data: ScreenshotData,
}

impl Screenshot {
    pub fn create(params: CreateScreenshot, ids: &dyn IdGenerator) -> Result<Self> {
        let now = Utc::now();
        Self::from_data(ScreenshotData {
            id: ids.generate(),
            job_id: params.job_id,
            client_id: params.client_id,
            client_name: params.client_name,
            viewport: params.viewport,
            dark_mode: params.dark_mode,
            status: ScreenshotStatus::Pending,
            image_metadata: None,
            storage_info: None,
            capture_config: params.capture_config,
            comparison_results: Vec::new(),
            retry_count: 0,
            max_retries: params.max_retries,
            processing_time_ms: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            captured_at: None,
            ready_at: None,
            archived_at: None,
        })
    }

    pub fn from_data(data: ScreenshotData) -> Result<Self> {
        validate_data(&data)?;
        Ok(Self { data })
    }

    pub fn to_data(&self) -> ScreenshotData {
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

    pub fn client_id(&self) -> &str {
        &self.data.client_id
    }

    pub fn client_name(&self) -> &str {
        &self.data.client_name
    }

    pub fn viewport(&self) -> &Viewport {
        &self.data.viewport
    }

    pub fn dark_mode(&self) -> bool {
        self.data.dark_mode
    }

    pub fn theme(&self) -> Theme {
        Theme::from_dark_mode(self.data.dark_mode)
    }

    pub fn status(&self) -> ScreenshotStatus {
        self.data.status
    }

    pub fn image_metadata(&self) -> Option<&ImageMetadata> {
        self.data.image_metadata.as_ref()
    }

    pub fn storage_info(&self) -> Option<&StorageInfo> {
        self.data.storage_info.as_ref()
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.data.capture_config
    }

    pub fn comparison_results(&self) -> &[ComparisonResult] {
        &self.data.comparison_results
    }

    pub fn retry_count(&self) -> u32 {
        self.data.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.data.max_retries
    }

    pub fn processing_time_ms(&self) -> Option<u64> {
        self.data.processing_time_ms
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.error_message.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.data.created_at
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.data.captured_at
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.data.ready_at
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn start_capture(&mut self) -> Result<()> {
        self.require(ScreenshotStatus::Pending, "start capture")?;
        self.transition(ScreenshotStatus::Capturing);
        Ok(())
    }

    /// Record a finished capture and how long it took in milliseconds
    pub fn mark_captured(
        &mut self,
        metadata: ImageMetadata,
        processing_time_ms: u64,
    ) -> Result<()> {
        self.require(ScreenshotStatus::Capturing, "mark captured")?;
        metadata.validate()?;
        self.data.image_metadata = Some(metadata);
        self.data.processing_time_ms = Some(processing_time_ms);
        self.data.captured_at = Some(Utc::now());
        self.transition(ScreenshotStatus::Captured);
        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<()> {
        self.require(ScreenshotStatus::Captured, "start processing")?;
        self.transition(ScreenshotStatus::Processing);
        Ok(())
    }

    pub fn mark_ready(&mut self, storage_info: StorageInfo) -> Result<()> {
        self.require(ScreenshotStatus::Processing, "mark ready")?;
        storage_info.validate()?;
        self.data.storage_info = Some(storage_info);
        self.data.ready_at = Some(Utc::now());
        self.transition(ScreenshotStatus::Ready);
        Ok(())
    }

    /// Record an external failure; allowed until the screenshot is ready
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        match self.data.status {
            ScreenshotStatus::Pending
            | ScreenshotStatus::Capturing
            | ScreenshotStatus::Captured
            | ScreenshotStatus::Processing => {}
            current => {
                return Err(Error::transition(
                    ENTITY,
                    "fail",
                    current,
                    "'pending', 'capturing', 'captured' or 'processing'",
                ));
            }
        }
        let message = message.into();
        warn!(
            screenshot_id = %self.data.id,
            client = %self.data.client_id,
            retry = self.data.retry_count,
            "Screenshot failed: {}",
            message
        );
        self.data.error_message = Some(message);
        self.transition(ScreenshotStatus::Failed);
        Ok(())
    }

    /// Send a failed screenshot back to pending, spending one retry
    pub fn retry(&mut self) -> Result<()> {
        self.require(ScreenshotStatus::Failed, "retry")?;
        if self.data.retry_count >= self.data.max_retries {
            return Err(Error::RetryExhausted {
                screenshot_id: self.data.id.to_string(),
                retry_count: self.data.retry_count,
                max_retries: self.data.max_retries,
            });
        }
        self.data.retry_count += 1;
        self.data.error_message = None;
        self.data.image_metadata = None;
        self.data.processing_time_ms = None;
        self.data.captured_at = None;
        self.transition(ScreenshotStatus::Pending);
        Ok(())
    }

    pub fn archive(&mut self) -> Result<()> {
        self.require(ScreenshotStatus::Ready, "archive")?;
        self.data.archived_at = Some(Utc::now());
        self.transition(ScreenshotStatus::Archived);
        Ok(())
    }

    /// Attach a diff result, replacing any earlier result for the same baseline
    pub fn add_comparison_result(&mut self, result: ComparisonResult) -> Result<()> {
        self.require(ScreenshotStatus::Ready, "add comparison result")?;
        result.validate()?;
        let results = &mut self.data.comparison_results;
        match results
            .iter_mut()
            .find(|r| r.baseline_screenshot_id == result.baseline_screenshot_id)
        {
            Some(existing) => *existing = result,
            None => results.push(result),
        }
        self.data.updated_at = Utc::now();
        Ok(())
    }

    pub fn update_storage_info(&mut self, storage_info: StorageInfo) -> Result<()> {
        storage_info.validate()?;
        self.data.storage_info = Some(storage_info);
        self.data.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the capture config; only possible before capture begins
    pub fn update_capture_config(&mut self, capture_config: CaptureConfig) -> Result<()> {
        self.require(ScreenshotStatus::Pending, "update capture config")?;
        capture_config.validate()?;
        self.data.capture_config = capture_config;
        self.data.updated_at = Utc::now();
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_ready(&self) -> bool {
        self.data.status == ScreenshotStatus::Ready
    }

    pub fn is_failed(&self) -> bool {
        self.data.status == ScreenshotStatus::Failed
    }

    pub fn can_retry(&self) -> bool {
        self.is_failed() && self.data.retry_count < self.data.max_retries
    }

    /// Nothing further will happen without outside intervention
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.data.status,
            ScreenshotStatus::Ready | ScreenshotStatus::Failed | ScreenshotStatus::Archived
        ) && !self.can_retry()
    }

    pub fn url(&self) -> Option<&str> {
        self.data.storage_info.as_ref().map(|s| s.url.as_str())
    }

    pub fn thumbnail_url(&self) -> Option<&str> {
        self.data
            .storage_info
            .as_ref()
            .and_then(|s| s.thumbnail_url.as_deref())
    }

    /// CDN url, falling back to the primary url
    pub fn cdn_url(&self) -> Option<&str> {
        self.data
            .storage_info
            .as_ref()
            .map(|s| s.cdn_url.as_deref().unwrap_or(s.url.as_str()))
    }

    /// Size with 1024-based units, e.g. `1.5 MB`
    pub fn file_size_formatted(&self) -> Option<String> {
        self.data
            .image_metadata
            .as_ref()
            .map(|m| format_bytes(m.size_bytes))
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.data.image_metadata.as_ref().map(|m| (m.width, m.height))
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        self.dimensions().map(|(w, h)| w as f64 / h as f64)
    }

    pub fn comparison_for(&self, baseline_id: Uuid) -> Option<&ComparisonResult> {
        self.data
            .comparison_results
            .iter()
            .find(|r| r.baseline_screenshot_id == baseline_id)
    }

    /// Similarity against `baseline_id` is at least [`DEFAULT_SIMILARITY_THRESHOLD`]
    pub fn has_high_similarity(&self, baseline_id: Uuid) -> bool {
        self.has_similarity_at_least(baseline_id, DEFAULT_SIMILARITY_THRESHOLD)
    }

    pub fn has_similarity_at_least(&self, baseline_id: Uuid, threshold: f64) -> bool {
        self.comparison_for(baseline_id)
            .map_or(false, |r| r.passes(threshold))
    }

    pub fn best_comparison(&self) -> Option<&ComparisonResult> {
        self.data
            .comparison_results
            .iter()
            .max_by(|a, b| a.similarity_score.total_cmp(&b.similarity_score))
    }

    /// e.g. `Gmail - mobile 375x667@2x - dark`
    pub fn description(&self) -> String {
        format!(
            "{} - {} - {}",
            self.data.client_name,
            self.data.viewport,
            self.theme()
        )
    }

    fn require(&self, required: ScreenshotStatus, action: &'static str) -> Result<()> {
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

    fn transition(&mut self, to: ScreenshotStatus) {
        debug!(
            screenshot_id = %self.data.id,
            from = %self.data.status,
            to = %to,
            "Screenshot transition"
        );
        self.data.status = to;
        self.data.updated_at = Utc::now();
    }
}

impl TryFrom<ScreenshotData> for Screenshot {
    type Error = Error;

    fn try_from(data: ScreenshotData) -> Result<Self> {
        Self::from_data(data)
    }
}

impl From<Screenshot> for ScreenshotData {
    fn from(screenshot: Screenshot) -> Self {
        screenshot.data
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    let text = format!("{:.2}", rounded);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", text, UNITS[unit])
}

fn validate_data(data: &ScreenshotData) -> Result<()> {
    if data.client_id.trim().is_empty() {
        return Err(Error::validation(ENTITY, "client id must not be empty"));
    }
    if data.client_name.trim().is_empty() {
        return Err(Error::validation(ENTITY, "client name must not be empty"));
    }
    data.viewport.validate(ENTITY)?;
    data.capture_config.validate()?;

    if data.retry_count > data.max_retries {
        return Err(Error::validation(
            ENTITY,
            format!(
                "retry count {} exceeds max retries {}",
                data.retry_count, data.max_retries
            ),
        ));
    }
    if data.status == ScreenshotStatus::Captured && data.captured_at.is_none() {
        return Err(Error::validation(ENTITY, "captured screenshot is missing captured_at"));
    }
    if matches!(data.status, ScreenshotStatus::Ready | ScreenshotStatus::Archived)
        && data.storage_info.is_none()
    {
        return Err(Error::validation(
            ENTITY,
            format!("{} screenshot is missing storage info", data.status),
        ));
    }
    if let Some(metadata) = &data.image_metadata {
        metadata.validate()?;
    }
    if let Some(storage) = &data.storage_info {
        storage.validate()?;
    }
    for (i, result) in data.comparison_results.iter().enumerate() {
        result.validate()?;
        if data.comparison_results[..i]
            .iter()
            .any(|r| r.baseline_screenshot_id == result.baseline_screenshot_id)
        {
            return Err(Error::validation(
                ENTITY,
                format!(
                    "more than one comparison against baseline {}",
                    result.baseline_screenshot_id
                ),
            ));
        }
    }
    Ok(())
}
