use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{select_latest, CompendiumRecord, CompendiumStore, JobRecord, JobStore};

/// In-process store. Primarily for tests and for embedding the engine
/// without a registry file on disk.
#[derive(Default)]
pub struct MemoryStore {
    compendia: RwLock<Vec<CompendiumRecord>>,
    jobs: RwLock<Vec<JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_compendium(&self, id: &str) {
        self.compendia.write().push(CompendiumRecord { id: id.to_string() });
    }

    pub fn add_job(&self, job: JobRecord) {
        self.jobs.write().push(job);
    }
}

#[async_trait]
impl CompendiumStore for MemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<CompendiumRecord>> {
        Ok(self.compendia.read().iter().find(|c| c.id == id).cloned())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn latest_job(
        &self,
        compendium_id: &str,
        only_successful: bool,
    ) -> Result<Option<JobRecord>> {
        Ok(select_latest(&self.jobs.read(), compendium_id, only_successful))
    }
}
