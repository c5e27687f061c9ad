//! Pipeline resolution: from a run row to a concrete definition.

use async_trait::async_trait;
use std::path::PathBuf;

use zephyr_config::RunContext;
use zephyr_core::pipeline::PipelineDef;
use zephyr_core::{Error, Result};
use zephyr_store::{ProjectRecord, RunRecord};

/// Resolves the pipeline definition for a run. Condition expressions are
/// already booleans by the time the definition leaves the resolver.
#[async_trait]
pub trait PipelineResolver: Send + Sync {
    async fn resolve(&self, project: &ProjectRecord, run: &RunRecord) -> Result<PipelineDef>;
}

/// Loads `project.config_path` from disk, relative to an optional root.
pub struct FileResolver {
    root: Option<PathBuf>,
}

impl FileResolver {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl Default for FileResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineResolver for FileResolver {
    async fn resolve(&self, project: &ProjectRecord, run: &RunRecord) -> Result<PipelineDef> {
        let path = match &self.root {
            Some(root) => root.join(&project.config_path),
            None => PathBuf::from(&project.config_path),
        };
        let ctx = RunContext {
            branch: run.branch.clone(),
            trigger_type: run.trigger_type.clone(),
        };
        zephyr_config::load_pipeline(&path, &ctx)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
    }
}
