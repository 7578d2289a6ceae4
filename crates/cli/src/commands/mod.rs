//! CLI Commands

pub mod clients;
pub mod job;
pub mod report;

use anyhow::{Context as _, Result};
use mailproof_common::Database;
use uuid::Uuid;

use crate::config::MailProofConfig;
use crate::output::OutputFormat;

/// Everything a command needs
pub struct Context {
    pub db: Database,
    pub config: MailProofConfig,
    pub format: OutputFormat,
}

impl Context {
    pub fn open(config: MailProofConfig, format: OutputFormat) -> Result<Self> {
        let db = Database::open(config.db_path())
            .with_context(|| format!("opening store at {}", config.db_path().display()))?;
        Ok(Self { db, config, format })
    }
}

pub(crate) fn parse_job_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("'{}' is not a valid job id", id))
}
