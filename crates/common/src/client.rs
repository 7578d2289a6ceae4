//! Email clients
//!
//! An [`EmailClient`] describes one email reading environment: how it renders, which
//! viewports it is tested at and which automation backend can drive it. Clients are
//! created once (see [`crate::presets`] for the built-in catalog) and referenced by id
//! from render jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{validate_viewports, ImageFormat, Viewport};
use crate::{Error, Result};

const ENTITY: &str = "email client";

/// Client form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Web,
    Desktop,
    Mobile,
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientType::Web => write!(f, "web"),
            ClientType::Desktop => write!(f, "desktop"),
            ClientType::Mobile => write!(f, "mobile"),
        }
    }
}

/// Operating platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
    Ios,
    Android,
    Web,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Macos => write!(f, "macos"),
            Platform::Linux => write!(f, "linux"),
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
            Platform::Web => write!(f, "web"),
        }
    }
}

/// HTML rendering engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderingEngine {
    Webkit,
    Blink,
    Gecko,
    Trident,
    Word,
    Native,
}

impl std::fmt::Display for RenderingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderingEngine::Webkit => write!(f, "webkit"),
            RenderingEngine::Blink => write!(f, "blink"),
            RenderingEngine::Gecko => write!(f, "gecko"),
            RenderingEngine::Trident => write!(f, "trident"),
            RenderingEngine::Word => write!(f, "word"),
            RenderingEngine::Native => write!(f, "native"),
        }
    }
}

/// Named rendering capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    DarkMode,
    ResponsiveDesign,
    Css3,
    WebFonts,
    Flexbox,
    Grid,
    Animations,
    CustomProperties,
    AccessibilityFeatures,
    VideoSupport,
}

impl Feature {
    /// Flags that feed [`EmailClient::compatibility_score`]
    pub const SCORED: [Feature; 8] = [
        Feature::DarkMode,
        Feature::ResponsiveDesign,
        Feature::Css3,
        Feature::WebFonts,
        Feature::Flexbox,
        Feature::Grid,
        Feature::Animations,
        Feature::AccessibilityFeatures,
    ];
}

impl std::str::FromStr for Feature {
    type Err = Error;

    /// Accepts `darkMode`, `dark_mode` and `dark-mode` spellings
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "darkmode" => Ok(Feature::DarkMode),
            "responsivedesign" | "responsive" => Ok(Feature::ResponsiveDesign),
            "css3" => Ok(Feature::Css3),
            "webfonts" => Ok(Feature::WebFonts),
            "flexbox" => Ok(Feature::Flexbox),
            "grid" => Ok(Feature::Grid),
            "animations" => Ok(Feature::Animations),
            "customproperties" => Ok(Feature::CustomProperties),
            "accessibilityfeatures" | "accessibility" => Ok(Feature::AccessibilityFeatures),
            "videosupport" | "video" => Ok(Feature::VideoSupport),
            _ => Err(Error::validation(ENTITY, format!("unknown feature '{}'", s))),
        }
    }
}

/// Rendering capabilities of a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub responsive_design: bool,
    #[serde(default)]
    pub css3: bool,
    #[serde(default)]
    pub web_fonts: bool,
    #[serde(default)]
    pub flexbox: bool,
    #[serde(default)]
    pub grid: bool,
    #[serde(default)]
    pub animations: bool,
    #[serde(default)]
    pub custom_properties: bool,
    #[serde(default)]
    pub accessibility_features: bool,
    #[serde(default = "default_image_formats")]
    pub supported_image_formats: Vec<ImageFormat>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    #[serde(default)]
    pub video_support: bool,
}

fn default_image_formats() -> Vec<ImageFormat> {
    vec![ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Gif]
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            dark_mode: false,
            responsive_design: false,
            css3: false,
            web_fonts: false,
            flexbox: false,
            grid: false,
            animations: false,
            custom_properties: false,
            accessibility_features: false,
            supported_image_formats: default_image_formats(),
            max_width: None,
            max_height: None,
            video_support: false,
        }
    }
}

impl ClientCapabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::DarkMode => self.dark_mode,
            Feature::ResponsiveDesign => self.responsive_design,
            Feature::Css3 => self.css3,
            Feature::WebFonts => self.web_fonts,
            Feature::Flexbox => self.flexbox,
            Feature::Grid => self.grid,
            Feature::Animations => self.animations,
            Feature::CustomProperties => self.custom_properties,
            Feature::AccessibilityFeatures => self.accessibility_features,
            Feature::VideoSupport => self.video_support,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.supported_image_formats.is_empty() {
            return Err(Error::validation(
                ENTITY,
                "at least one supported image format is required",
            ));
        }
        if self.max_width == Some(0) || self.max_height == Some(0) {
            return Err(Error::validation(ENTITY, "max width/height must be positive"));
        }
        Ok(())
    }
}

/// Partial capability update; `None` leaves a flag as is
#[derive(Debug, Clone, Default)]
pub struct CapabilitiesUpdate {
    pub dark_mode: Option<bool>,
    pub responsive_design: Option<bool>,
    pub css3: Option<bool>,
    pub web_fonts: Option<bool>,
    pub flexbox: Option<bool>,
    pub grid: Option<bool>,
    pub animations: Option<bool>,
    pub custom_properties: Option<bool>,
    pub accessibility_features: Option<bool>,
    pub supported_image_formats: Option<Vec<ImageFormat>>,
    pub max_width: Option<Option<u32>>,
    pub max_height: Option<Option<u32>>,
    pub video_support: Option<bool>,
}

impl CapabilitiesUpdate {
    fn apply(self, caps: &mut ClientCapabilities) {
        if let Some(v) = self.dark_mode {
            caps.dark_mode = v;
        }
        if let Some(v) = self.responsive_design {
            caps.responsive_design = v;
        }
        if let Some(v) = self.css3 {
            caps.css3 = v;
        }
        if let Some(v) = self.web_fonts {
            caps.web_fonts = v;
        }
        if let Some(v) = self.flexbox {
            caps.flexbox = v;
        }
        if let Some(v) = self.grid {
            caps.grid = v;
        }
        if let Some(v) = self.animations {
            caps.animations = v;
        }
        if let Some(v) = self.custom_properties {
            caps.custom_properties = v;
        }
        if let Some(v) = self.accessibility_features {
            caps.accessibility_features = v;
        }
        if let Some(v) = self.supported_image_formats {
            caps.supported_image_formats = v;
        }
        if let Some(v) = self.max_width {
            caps.max_width = v;
        }
        if let Some(v) = self.max_height {
            caps.max_height = v;
        }
        if let Some(v) = self.video_support {
            caps.video_support = v;
        }
    }
}

/// How a client is exercised during testing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 1 (lowest) to 10 (highest)
    #[serde(default = "default_test_priority")]
    pub priority: u8,
    /// Per-capture timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Capture retries, 0-3
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_screenshot_delay_ms")]
    pub screenshot_delay_ms: u64,
    #[serde(default = "default_load_wait_ms")]
    pub load_wait_ms: u64,
    #[serde(default = "default_true")]
    pub dark_mode_test: bool,
    pub viewports: Vec<Viewport>,
}

fn default_true() -> bool {
    true
}

fn default_test_priority() -> u8 {
    5
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    2
}

fn default_screenshot_delay_ms() -> u64 {
    1_000
}

fn default_load_wait_ms() -> u64 {
    2_000
}

/// Highest retry budget a client may declare
pub const MAX_CLIENT_RETRIES: u32 = 3;

/// Upper bound for each per-client timing (timeout, load wait, screenshot delay)
pub const MAX_CLIENT_TIMING_MS: u64 = 10 * 60 * 1000;

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_test_priority(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            screenshot_delay_ms: default_screenshot_delay_ms(),
            load_wait_ms: default_load_wait_ms(),
            dark_mode_test: true,
            viewports: Viewport::defaults(),
        }
    }
}

impl TestConfig {
    fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.priority) {
            return Err(Error::validation(
                ENTITY,
                format!("test priority must be within 1..=10, got {}", self.priority),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::validation(ENTITY, "test timeout must be positive"));
        }
        for (name, value) in [
            ("test timeout", self.timeout_ms),
            ("load wait", self.load_wait_ms),
            ("screenshot delay", self.screenshot_delay_ms),
        ] {
            if value > MAX_CLIENT_TIMING_MS {
                return Err(Error::validation(
                    ENTITY,
                    format!("{} must be at most {} ms, got {}", name, MAX_CLIENT_TIMING_MS, value),
                ));
            }
        }
        if self.retries > MAX_CLIENT_RETRIES {
            return Err(Error::validation(
                ENTITY,
                format!(
                    "retries must be within 0..={}, got {}",
                    MAX_CLIENT_RETRIES, self.retries
                ),
            ));
        }
        validate_viewports(ENTITY, &self.viewports)
    }
}

/// Partial test config update; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct TestConfigUpdate {
    pub enabled: Option<bool>,
    pub priority: Option<u8>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub screenshot_delay_ms: Option<u64>,
    pub load_wait_ms: Option<u64>,
    pub dark_mode_test: Option<bool>,
    pub viewports: Option<Vec<Viewport>>,
}

impl TestConfigUpdate {
    fn apply(self, config: &mut TestConfig) {
        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = self.priority {
            config.priority = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.retries {
            config.retries = v;
        }
        if let Some(v) = self.screenshot_delay_ms {
            config.screenshot_delay_ms = v;
        }
        if let Some(v) = self.load_wait_ms {
            config.load_wait_ms = v;
        }
        if let Some(v) = self.dark_mode_test {
            config.dark_mode_test = v;
        }
        if let Some(v) = self.viewports {
            config.viewports = v;
        }
    }
}

/// Automation backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Docker,
    Vm,
    Browser,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerType::Docker => write!(f, "docker"),
            WorkerType::Vm => write!(f, "vm"),
            WorkerType::Browser => write!(f, "browser"),
        }
    }
}

/// Browser engine driven by a headless-browser worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    Chromium,
    Firefox,
    Webkit,
}

impl std::fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserKind::Chromium => write!(f, "chromium"),
            BrowserKind::Firefox => write!(f, "firefox"),
            BrowserKind::Webkit => write!(f, "webkit"),
        }
    }
}

/// Backend-specific automation settings, one variant per worker type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "worker_type", rename_all = "snake_case")]
pub enum AutomationConfig {
    Docker {
        image: String,
        #[serde(default = "default_image_tag")]
        tag: String,
        #[serde(default)]
        environment: BTreeMap<String, String>,
    },
    Vm {
        template: String,
        #[serde(default)]
        snapshot: Option<String>,
        #[serde(default)]
        setup_commands: Vec<String>,
        #[serde(default)]
        teardown_commands: Vec<String>,
    },
    Browser {
        browser: BrowserKind,
        #[serde(default = "default_true")]
        headless: bool,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },
}

fn default_image_tag() -> String {
    "latest".to_string()
}

impl AutomationConfig {
    pub fn worker_type(&self) -> WorkerType {
        match self {
            AutomationConfig::Docker { .. } => WorkerType::Docker,
            AutomationConfig::Vm { .. } => WorkerType::Vm,
            AutomationConfig::Browser { .. } => WorkerType::Browser,
        }
    }

    /// Human-readable target, e.g. `mailproof/yandex:latest` or `vm:win10-outlook2019`
    pub fn target(&self) -> String {
        match self {
            AutomationConfig::Docker { image, tag, .. } => format!("{}:{}", image, tag),
            AutomationConfig::Vm { template, .. } => format!("vm:{}", template),
            AutomationConfig::Browser { browser, headless, .. } => {
                if *headless {
                    format!("{} (headless)", browser)
                } else {
                    browser.to_string()
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            AutomationConfig::Docker { image, tag, .. } => {
                if image.trim().is_empty() {
                    return Err(Error::validation(ENTITY, "docker worker requires an image"));
                }
                if tag.trim().is_empty() {
                    return Err(Error::validation(ENTITY, "docker image tag must not be empty"));
                }
            }
            AutomationConfig::Vm {
                template,
                setup_commands,
                teardown_commands,
                ..
            } => {
                if template.trim().is_empty() {
                    return Err(Error::validation(ENTITY, "vm worker requires a template"));
                }
                if setup_commands
                    .iter()
                    .chain(teardown_commands.iter())
                    .any(|c| c.trim().is_empty())
                {
                    return Err(Error::validation(ENTITY, "vm commands must not be empty"));
                }
            }
            AutomationConfig::Browser { .. } => {}
        }
        Ok(())
    }
}

/// Persisted layout of an email client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailClientData {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub vendor: String,
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub platform: Platform,
    pub rendering_engine: RenderingEngine,
    pub market_share: Option<f64>,
    pub capabilities: ClientCapabilities,
    pub test_config: TestConfig,
    pub automation_config: AutomationConfig,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for [`EmailClient::create`]
#[derive(Debug, Clone)]
pub struct CreateEmailClient {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub vendor: String,
    pub version: Option<String>,
    pub client_type: ClientType,
    pub platform: Platform,
    pub rendering_engine: RenderingEngine,
    pub market_share: Option<f64>,
    pub capabilities: ClientCapabilities,
    pub test_config: TestConfig,
    pub automation_config: AutomationConfig,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

/// Descriptive fields [`EmailClient::update`] may change
#[derive(Debug, Clone, Default)]
pub struct EmailClientUpdate {
    pub display_name: Option<String>,
    pub vendor: Option<String>,
    pub version: Option<String>,
    pub market_share: Option<f64>,
    pub description: Option<String>,
    pub automation_config: Option<AutomationConfig>,
}

/// A validated email client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EmailClientData", into = "EmailClientData")]
pub struct EmailClient {
    data: EmailClientData,
}

impl EmailClient {
    pub fn create(params: CreateEmailClient) -> Result<Self> {
        let now = Utc::now();
        let mut tags = Vec::new();
        for tag in params.tags {
            let tag = normalize_tag(&tag);
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Self::from_data(EmailClientData {
            id: params.id,
            name: params.name,
            display_name: params.display_name,
            vendor: params.vendor,
            version: params.version,
            client_type: params.client_type,
            platform: params.platform,
            rendering_engine: params.rendering_engine,
            market_share: params.market_share,
            capabilities: params.capabilities,
            test_config: params.test_config,
            automation_config: params.automation_config,
            is_active: true,
            tags,
            description: params.description,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn from_data(data: EmailClientData) -> Result<Self> {
        validate_data(&data)?;
        Ok(Self { data })
    }

    pub fn to_data(&self) -> EmailClientData {
        self.data.clone()
    }

    pub fn validate(&self) -> Result<()> {
        validate_data(&self.data)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.data.id
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn display_name(&self) -> &str {
        &self.data.display_name
    }

    pub fn vendor(&self) -> &str {
        &self.data.vendor
    }

    pub fn version(&self) -> Option<&str> {
        self.data.version.as_deref()
    }

    pub fn client_type(&self) -> ClientType {
        self.data.client_type
    }

    pub fn platform(&self) -> Platform {
        self.data.platform
    }

    pub fn rendering_engine(&self) -> RenderingEngine {
        self.data.rendering_engine
    }

    pub fn market_share(&self) -> Option<f64> {
        self.data.market_share
    }

    pub fn capabilities(&self) -> &ClientCapabilities {
        &self.data.capabilities
    }

    pub fn test_config(&self) -> &TestConfig {
        &self.data.test_config
    }

    pub fn automation_config(&self) -> &AutomationConfig {
        &self.data.automation_config
    }

    pub fn is_active(&self) -> bool {
        self.data.is_active
    }

    pub fn tags(&self) -> &[String] {
        &self.data.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = normalize_tag(tag);
        self.data.tags.iter().any(|t| *t == tag)
    }

    pub fn description(&self) -> Option<&str> {
        self.data.description.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.data.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.data.updated_at
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn supports_feature(&self, feature: Feature) -> bool {
        self.data.capabilities.supports(feature)
    }

    /// The client renders dark mode and dark-mode testing is enabled for it
    pub fn supports_dark_mode(&self) -> bool {
        self.data.capabilities.dark_mode && self.data.test_config.dark_mode_test
    }

    /// First viewport flagged default, else the first configured
    pub fn default_viewport(&self) -> &Viewport {
        let viewports = &self.data.test_config.viewports;
        viewports
            .iter()
            .find(|v| v.is_default)
            .unwrap_or(&viewports[0])
    }

    pub fn is_responsive_capable(&self) -> bool {
        self.data.capabilities.responsive_design
    }

    pub fn worker_type(&self) -> WorkerType {
        self.data.automation_config.worker_type()
    }

    pub fn requires_vm(&self) -> bool {
        self.worker_type() == WorkerType::Vm
    }

    pub fn can_use_container(&self) -> bool {
        self.worker_type() == WorkerType::Docker
    }

    /// Conservative upper bound, in milliseconds, for testing this client once
    pub fn estimated_test_duration(&self) -> u64 {
        let config = &self.data.test_config;
        let themes = if config.dark_mode_test { 2 } else { 1 };
        config
            .timeout_ms
            .saturating_mul(config.viewports.len() as u64)
            .saturating_mul(themes)
            .saturating_add(config.load_wait_ms)
            .saturating_add(config.screenshot_delay_ms)
    }

    pub fn is_high_priority(&self) -> bool {
        self.data.test_config.priority >= 8 || self.data.market_share.unwrap_or(0.0) >= 20.0
    }

    /// Percentage (0-100, rounded) of the scored capability flags that are set
    pub fn compatibility_score(&self) -> u8 {
        let supported = Feature::SCORED
            .iter()
            .filter(|f| self.supports_feature(**f))
            .count();
        ((supported as f64 / Feature::SCORED.len() as f64) * 100.0).round() as u8
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub fn activate(&mut self) {
        self.data.is_active = true;
        self.data.updated_at = Utc::now();
        debug!(client_id = %self.data.id, "Activated email client");
    }

    pub fn deactivate(&mut self) {
        self.data.is_active = false;
        self.data.updated_at = Utc::now();
        debug!(client_id = %self.data.id, "Deactivated email client");
    }

    pub fn update(&mut self, update: EmailClientUpdate) -> Result<()> {
        self.stage(|data| {
            if let Some(v) = update.display_name {
                data.display_name = v;
            }
            if let Some(v) = update.vendor {
                data.vendor = v;
            }
            if let Some(v) = update.version {
                data.version = Some(v);
            }
            if let Some(v) = update.market_share {
                data.market_share = Some(v);
            }
            if let Some(v) = update.description {
                data.description = Some(v);
            }
            if let Some(v) = update.automation_config {
                data.automation_config = v;
            }
        })
    }

    pub fn update_test_config(&mut self, update: TestConfigUpdate) -> Result<()> {
        self.stage(|data| update.apply(&mut data.test_config))
    }

    pub fn update_capabilities(&mut self, update: CapabilitiesUpdate) -> Result<()> {
        self.stage(|data| update.apply(&mut data.capabilities))
    }

    /// Add a tag; tags are lowercased and kept unique
    pub fn add_tag(&mut self, tag: &str) -> Result<()> {
        let tag = normalize_tag(tag);
        if tag.is_empty() {
            return Err(Error::validation(ENTITY, "tag must not be empty"));
        }
        if !self.data.tags.contains(&tag) {
            self.data.tags.push(tag);
            self.data.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Remove a tag, returning whether it was present
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let tag = normalize_tag(tag);
        let before = self.data.tags.len();
        self.data.tags.retain(|t| *t != tag);
        let removed = self.data.tags.len() != before;
        if removed {
            self.data.updated_at = Utc::now();
        }
        removed
    }

    /// Apply `f` to a copy, validate it, then commit
    fn stage(&mut self, f: impl FnOnce(&mut EmailClientData)) -> Result<()> {
        let mut staged = self.data.clone();
        f(&mut staged);
        staged.updated_at = Utc::now();
        validate_data(&staged)?;
        self.data = staged;
        Ok(())
    }
}

impl TryFrom<EmailClientData> for EmailClient {
    type Error = Error;

    fn try_from(data: EmailClientData) -> Result<Self> {
        Self::from_data(data)
    }
}

impl From<EmailClient> for EmailClientData {
    fn from(client: EmailClient) -> Self {
        client.data
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

fn validate_data(data: &EmailClientData) -> Result<()> {
    if data.id.trim().is_empty() {
        return Err(Error::validation(ENTITY, "id must not be empty"));
    }
    if data.name.trim().is_empty() {
        return Err(Error::validation(ENTITY, "name must not be empty"));
    }
    if data.display_name.trim().is_empty() {
        return Err(Error::validation(ENTITY, "display name must not be empty"));
    }
    if data.vendor.trim().is_empty() {
        return Err(Error::validation(ENTITY, "vendor must not be empty"));
    }

    match (data.client_type, data.platform) {
        (ClientType::Web, Platform::Web) => {}
        (ClientType::Web, platform) => {
            return Err(Error::validation(
                ENTITY,
                format!("web client '{}' must use the web platform, got {}", data.id, platform),
            ));
        }
        (ClientType::Mobile, Platform::Ios | Platform::Android) => {}
        (ClientType::Mobile, platform) => {
            return Err(Error::validation(
                ENTITY,
                format!("mobile client '{}' must run on ios or android, got {}", data.id, platform),
            ));
        }
        (ClientType::Desktop, Platform::Windows | Platform::Macos | Platform::Linux) => {}
        (ClientType::Desktop, platform) => {
            return Err(Error::validation(
                ENTITY,
                format!("desktop client '{}' cannot run on {}", data.id, platform),
            ));
        }
    }

    if let Some(share) = data.market_share {
        if !(share.is_finite() && (0.0..=100.0).contains(&share)) {
            return Err(Error::validation(
                ENTITY,
                format!("market share must be within [0, 100], got {}", share),
            ));
        }
    }

    data.capabilities.validate()?;
    data.test_config.validate()?;
    data.automation_config.validate()?;

    if data.tags.iter().any(|t| t.is_empty() || *t != normalize_tag(t)) {
        return Err(Error::validation(ENTITY, "tags must be non-empty and lowercase"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CreateEmailClient {
        CreateEmailClient {
            id: "thunderbird".to_string(),
            name: "thunderbird".to_string(),
            display_name: "Thunderbird".to_string(),
            vendor: "Mozilla".to_string(),
            version: Some("115".to_string()),
            client_type: ClientType::Desktop,
            platform: Platform::Linux,
            rendering_engine: RenderingEngine::Gecko,
            market_share: Some(0.5),
            capabilities: ClientCapabilities {
                dark_mode: true,
                css3: true,
                web_fonts: true,
                flexbox: true,
                ..Default::default()
            },
            test_config: TestConfig::default(),
            automation_config: AutomationConfig::Docker {
                image: "mailproof/thunderbird".to_string(),
                tag: "115".to_string(),
                environment: BTreeMap::new(),
            },
            tags: vec!["Desktop".to_string(), "open-source".to_string(), "desktop".to_string()],
            description: None,
        }
    }

    #[test]
    fn test_create_normalizes_tags() {
        let client = EmailClient::create(params()).unwrap();
        assert_eq!(client.tags(), &["desktop".to_string(), "open-source".to_string()]);
        assert!(client.is_active());
        assert!(client.has_tag("DESKTOP"));
    }

    #[test]
    fn test_platform_consistency() {
        let mut web_on_windows = params();
        web_on_windows.client_type = ClientType::Web;
        web_on_windows.platform = Platform::Windows;
        assert!(EmailClient::create(web_on_windows).is_err());

        let mut mobile_on_linux = params();
        mobile_on_linux.client_type = ClientType::Mobile;
        assert!(EmailClient::create(mobile_on_linux).is_err());

        let mut mobile_on_ios = params();
        mobile_on_ios.client_type = ClientType::Mobile;
        mobile_on_ios.platform = Platform::Ios;
        assert!(EmailClient::create(mobile_on_ios).is_ok());
    }

    #[test]
    fn test_range_checks() {
        let mut share = params();
        share.market_share = Some(120.0);
        assert!(EmailClient::create(share).is_err());

        let mut retries = params();
        retries.test_config.retries = 4;
        assert!(EmailClient::create(retries).is_err());

        let mut priority = params();
        priority.test_config.priority = 0;
        assert!(EmailClient::create(priority).is_err());

        let mut viewports = params();
        viewports.test_config.viewports.clear();
        assert!(EmailClient::create(viewports).is_err());

        let mut image = params();
        image.automation_config = AutomationConfig::Docker {
            image: " ".to_string(),
            tag: "latest".to_string(),
            environment: BTreeMap::new(),
        };
        assert!(EmailClient::create(image).is_err());
    }

    #[test]
    fn test_timings_are_bounded() {
        let mut timeout = params();
        timeout.test_config.timeout_ms = u64::MAX / 2;
        assert!(EmailClient::create(timeout).is_err());

        let mut load_wait = params();
        load_wait.test_config.load_wait_ms = MAX_CLIENT_TIMING_MS + 1;
        assert!(EmailClient::create(load_wait).is_err());

        let mut data = EmailClient::create(params()).unwrap().to_data();
        data.test_config.screenshot_delay_ms = u64::MAX;
        assert!(EmailClient::from_data(data).is_err());

        let mut slowest = params();
        slowest.test_config.timeout_ms = MAX_CLIENT_TIMING_MS;
        slowest.test_config.load_wait_ms = MAX_CLIENT_TIMING_MS;
        slowest.test_config.screenshot_delay_ms = MAX_CLIENT_TIMING_MS;
        let client = EmailClient::create(slowest).unwrap();
        // 2 viewports x 2 themes + load wait + delay
        assert_eq!(client.estimated_test_duration(), 6 * MAX_CLIENT_TIMING_MS);
    }

    #[test]
    fn test_queries() {
        let client = EmailClient::create(params()).unwrap();
        assert!(client.supports_feature(Feature::Flexbox));
        assert!(!client.supports_feature(Feature::Grid));
        assert!(client.supports_dark_mode());
        assert!(!client.is_responsive_capable());
        assert_eq!(client.worker_type(), WorkerType::Docker);
        assert!(client.can_use_container());
        assert!(!client.requires_vm());
        assert_eq!(client.default_viewport().name, "desktop");
        assert!(!client.is_high_priority());
        // dark_mode, css3, web_fonts, flexbox of 8
        assert_eq!(client.compatibility_score(), 50);
        // 30s x 2 viewports x 2 themes + 2s load + 1s delay
        assert_eq!(client.estimated_test_duration(), 123_000);
    }

    #[test]
    fn test_default_viewport_falls_back_to_first() {
        let mut p = params();
        p.test_config.viewports = vec![Viewport::new("wide", 1200, 900), Viewport::mobile()];
        let client = EmailClient::create(p).unwrap();
        assert_eq!(client.default_viewport().name, "wide");
    }

    #[test]
    fn test_dark_mode_requires_capability_and_test_flag() {
        let mut client = EmailClient::create(params()).unwrap();
        client
            .update_test_config(TestConfigUpdate {
                dark_mode_test: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(!client.supports_dark_mode());
        assert_eq!(client.estimated_test_duration(), 63_000);
    }

    #[test]
    fn test_feature_parsing() {
        assert_eq!("darkMode".parse::<Feature>().unwrap(), Feature::DarkMode);
        assert_eq!("dark_mode".parse::<Feature>().unwrap(), Feature::DarkMode);
        assert_eq!("customProperties".parse::<Feature>().unwrap(), Feature::CustomProperties);
        assert!("blink-tag".parse::<Feature>().is_err());
    }

    #[test]
    fn test_rejected_update_leaves_client_untouched() {
        let mut client = EmailClient::create(params()).unwrap();
        let before = client.clone();

        let err = client
            .update_test_config(TestConfigUpdate {
                retries: Some(9),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(client, before);

        client
            .update_capabilities(CapabilitiesUpdate {
                grid: Some(true),
                max_width: Some(Some(800)),
                ..Default::default()
            })
            .unwrap();
        assert!(client.supports_feature(Feature::Grid));
        assert_eq!(client.capabilities().max_width, Some(800));
    }

    #[test]
    fn test_activation_and_tags() {
        let mut client = EmailClient::create(params()).unwrap();
        client.deactivate();
        assert!(!client.is_active());
        client.activate();
        assert!(client.is_active());

        client.add_tag("Linux").unwrap();
        assert!(client.has_tag("linux"));
        assert!(client.add_tag("  ").is_err());
        assert!(client.remove_tag("LINUX"));
        assert!(!client.remove_tag("linux"));
    }

    #[test]
    fn test_automation_serde_is_tagged() {
        let vm = AutomationConfig::Vm {
            template: "win10".to_string(),
            snapshot: None,
            setup_commands: vec!["start outlook".to_string()],
            teardown_commands: Vec::new(),
        };
        let value = serde_json::to_value(&vm).unwrap();
        assert_eq!(value["worker_type"], "vm");
        assert_eq!(value["template"], "win10");

        let browser: AutomationConfig = serde_json::from_value(serde_json::json!({
            "worker_type": "browser",
            "browser": "firefox"
        }))
        .unwrap();
        assert_eq!(browser.worker_type(), WorkerType::Browser);
        assert_eq!(browser.target(), "firefox (headless)");
    }

    #[test]
    fn test_data_roundtrip() {
        let client = EmailClient::create(params()).unwrap();
        let restored = EmailClient::from_data(client.to_data()).unwrap();
        assert_eq!(restored, client);

        let json = serde_json::to_string(&client).unwrap();
        assert!(json.contains("\"type\":\"desktop\""));
        let parsed: EmailClient = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, client);
    }
}
