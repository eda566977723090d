use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod json;
pub mod memory;

pub use json::JsonRegistry;
pub use memory::MemoryStore;

/// A compendium known to the service. The record only proves existence;
/// the file tree itself lives under the configured compendium directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompendiumRecord {
    pub id: String,
}

/// Outcome of one execution job run against a compendium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failure,
    Running,
}

/// One execution attempt. The job id derives the container image tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub compendium_id: String,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CompendiumStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<CompendiumRecord>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Most recently updated job for the compendium, newest `updated_at`
    /// first. With `only_successful` set, jobs that did not finish
    /// successfully are skipped entirely.
    async fn latest_job(
        &self,
        compendium_id: &str,
        only_successful: bool,
    ) -> Result<Option<JobRecord>>;
}

/// Picks the newest matching job out of an unordered slice. Shared by the
/// store implementations so the selection policy lives in one place.
pub(crate) fn select_latest(
    jobs: &[JobRecord],
    compendium_id: &str,
    only_successful: bool,
) -> Option<JobRecord> {
    jobs.iter()
        .filter(|job| job.compendium_id == compendium_id)
        .filter(|job| !only_successful || job.status == JobStatus::Success)
        .max_by_key(|job| job.updated_at)
        .cloned()
}
