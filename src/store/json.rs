use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{select_latest, CompendiumRecord, CompendiumStore, JobRecord, JobStore};

/// Registry document maintained by the tooling that creates compendia and
/// runs jobs. This service only reads it.
#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    compendia: Vec<CompendiumRecord>,
    #[serde(default)]
    jobs: Vec<JobRecord>,
}

/// File-backed store: one small JSON document holding every compendium and
/// job record. Re-read on each lookup so external writers take effect
/// without a restart.
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    pub fn new(path: PathBuf) -> Self {
        if !path.is_file() {
            warn!(
                "registry file {} not present, all lookups will miss",
                path.display()
            );
        }
        Self { path }
    }

    async fn load(&self) -> Result<RegistryFile> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default());
            }
            Err(err) => {
                return Err(err).context(format!("reading registry {}", self.path.display()));
            }
        };
        serde_json::from_slice(&raw)
            .context(format!("parsing registry {}", self.path.display()))
    }
}

#[async_trait]
impl CompendiumStore for JsonRegistry {
    async fn find_by_id(&self, id: &str) -> Result<Option<CompendiumRecord>> {
        let registry = self.load().await?;
        Ok(registry.compendia.into_iter().find(|c| c.id == id))
    }
}

#[async_trait]
impl JobStore for JsonRegistry {
    async fn latest_job(
        &self,
        compendium_id: &str,
        only_successful: bool,
    ) -> Result<Option<JobRecord>> {
        let registry = self.load().await?;
        Ok(select_latest(&registry.jobs, compendium_id, only_successful))
    }
}
