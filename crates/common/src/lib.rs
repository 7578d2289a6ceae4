//! MailProof Common Library
//!
//! Domain model for email render testing: render jobs, email clients, screenshots and
//! test results, plus capture planning, per-job event aggregation and persistence.

pub mod aggregator;
pub mod client;
pub mod db;
pub mod error;
pub mod ids;
pub mod job;
pub mod plan;
pub mod presets;
pub mod result;
pub mod score;
pub mod screenshot;
pub mod types;

// Re-export commonly used types
pub use aggregator::{
    spawn_aggregator, AggregatorHandle, AggregatorSnapshot, Dispatch, JobAggregator, WorkerEvent,
};
pub use client::{
    AutomationConfig, ClientCapabilities, ClientType, CreateEmailClient, EmailClient, Feature,
    Platform, RenderingEngine, TestConfig, WorkerType,
};
pub use db::Database;
pub use error::{Error, Result};
pub use ids::{IdGenerator, RandomIds, SequentialIds};
pub use job::{Analysis, CreateRenderJob, JobPriority, JobStatus, RenderJob, RenderJobConfig};
pub use plan::{CapturePlan, CapturePlanner, CaptureTask};
pub use result::{ClientTestResult, CreateTestResult, Severity, TestResult, TestStatus};
pub use score::CompatibilityLevel;
pub use screenshot::{CreateScreenshot, Screenshot, ScreenshotStatus};
pub use types::*;

/// MailProof version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mailproof")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
