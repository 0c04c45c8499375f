//! Workflow Storage (C8): file-backed store of Workflow Definitions, one
//! file per id under a configured directory.

use std::path::PathBuf;

use tracing::warn;

use crate::error::{Result, RuntimeError};
use crate::models::WorkflowDefinition;
use crate::paths::resolve_under;

#[derive(Clone, Debug)]
pub struct WorkflowStorage {
    workflows_dir: PathBuf,
}

impl WorkflowStorage {
    pub fn new(workflows_dir: impl Into<PathBuf>) -> Self {
        Self { workflows_dir: workflows_dir.into() }
    }

    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        workflow.validate().map_err(RuntimeError::Validation)?;
        let path = resolve_under(&self.workflows_dir, &workflow.id, "json")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        }
        let body = serde_json::to_vec_pretty(workflow)
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| RuntimeError::Persistence(e.to_string()))
    }

    /// Returns `Ok(None)` when the file is missing, matching the source's
    /// "missing is absence, not an error" semantics. A corrupt file on a
    /// direct `load` is a hard error (Corrupt).
    pub async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let path = resolve_under(&self.workflows_dir, id, "json")?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RuntimeError::Persistence(e.to_string())),
        };
        serde_json::from_slice(&body).map(Some).map_err(|e| RuntimeError::Corrupt {
            location: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Enumerates all workflow definitions under the directory. Invalid
    /// files are skipped with a warning, not fatal (§4.8).
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut entries = match tokio::fs::read_dir(&self.workflows_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RuntimeError::Persistence(e.to_string())),
        };

        let mut workflows = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RuntimeError::Persistence(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<WorkflowDefinition>(&body) {
                    Ok(workflow) => workflows.push(workflow),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid workflow file"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable workflow file"),
            }
        }
        workflows.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(workflows)
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<()> {
        let path = resolve_under(&self.workflows_dir, id, "json")?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::Persistence(e.to_string())),
        }
    }

    pub async fn workflow_exists(&self, id: &str) -> Result<bool> {
        let path = resolve_under(&self.workflows_dir, id, "json")?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }
}
