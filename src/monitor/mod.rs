use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::engine::{EngineError, Orchestrator};
use crate::model::ProjectSpec;
use crate::publish::{PublishError, git};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Git(#[from] PublishError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Watches the spec source-of-truth repository and enqueues one
/// reconciliation per changed project. Tracks the last processed revision
/// per watched ref so each change is handled exactly once, not on every
/// poll.
pub struct ChangeMonitor {
    orchestrator: Orchestrator,
    repo_url: String,
    branch: String,
    workdir: PathBuf,
    poll_interval: Duration,
    last_processed: Mutex<HashMap<String, String>>,
}

impl ChangeMonitor {
    pub fn new(
        orchestrator: Orchestrator,
        repo_url: &str,
        branch: &str,
        workdir: &Path,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            repo_url: repo_url.to_owned(),
            branch: branch.to_owned(),
            workdir: workdir.to_owned(),
            poll_interval,
            last_processed: Mutex::new(HashMap::new()),
        }
    }

    /// Background poll loop; stops when the shutdown flag flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(repo = %self.repo_url, branch = %self.branch, "change monitor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("change monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "error polling spec repository");
                    }
                }
            }
        }
    }

    fn checkout_dir(&self) -> PathBuf {
        self.workdir.join("spec-source")
    }

    /// Process one poll cycle: fetch, diff the revision range, enqueue runs.
    /// The recorded revision only advances when every enqueue was accepted,
    /// so a Busy project is retried on the next poll.
    pub async fn poll_once(&self) -> Result<(), MonitorError> {
        let dir = self.checkout_dir();
        if dir.join(".git").exists() {
            git::sync_to_remote(&dir, &self.branch).await?;
        } else {
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            git::clone_repo(&self.repo_url, &self.branch, &dir).await?;
        }

        let head = git::head_sha(&dir).await?;
        let last = self.last_processed.lock().await.get(&self.branch).cloned();
        if last.as_deref() == Some(head.as_str()) {
            return Ok(());
        }

        let changed: Vec<String> = match &last {
            Some(old) => git::changed_files(&dir, old, &head).await?,
            // First poll with no recorded revision: process everything once.
            None => git::ls_files(&dir, "projects").await?,
        }
        .into_iter()
        .filter(|p| is_project_file(p))
        .collect();

        tracing::debug!(revision = %head, changed = changed.len(), "spec revision processed");

        let mut all_accepted = true;
        for path in &changed {
            if !self.handle_change(&dir, path).await {
                all_accepted = false;
            }
        }

        if all_accepted {
            self.last_processed
                .lock()
                .await
                .insert(self.branch.clone(), head);
        }
        Ok(())
    }

    /// Returns false when the change must be retried on the next poll.
    async fn handle_change(&self, dir: &Path, path: &str) -> bool {
        let full = dir.join(path);
        let project = project_name(path);

        if !full.exists() {
            // Spec file removed: the project goes with it.
            return match self.orchestrator.delete(&project).await {
                Ok(run) => {
                    tracing::info!(%project, status = ?run.status, "project deletion enqueued by spec removal");
                    true
                }
                Err(EngineError::Busy(_)) => false,
                Err(EngineError::ShuttingDown) => false,
                Err(e) => {
                    tracing::error!(%project, error = %e, "failed to enqueue deletion");
                    true
                }
            };
        }

        let content = match tokio::fs::read_to_string(&full).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(%path, error = %e, "failed to read spec file");
                return false;
            }
        };

        let spec = match ProjectSpec::parse(&content) {
            Ok(spec) => spec,
            Err(e) => {
                // A broken file stays broken until the next commit; do not
                // hold the revision back for it.
                tracing::error!(%path, error = %e, "spec file does not parse");
                return true;
            }
        };

        if spec.name != project {
            tracing::error!(%path, spec_name = %spec.name, "spec name does not match file name");
            return true;
        }

        match self.orchestrator.reconcile(spec).await {
            Ok(run) => {
                tracing::info!(%project, run = %run.id, status = ?run.status, "reconciliation enqueued by spec change");
                true
            }
            Err(EngineError::Busy(_)) => {
                tracing::warn!(%project, "project busy, change will be retried next poll");
                false
            }
            Err(EngineError::ShuttingDown) => false,
            Err(e @ EngineError::ClusterMismatch { .. }) => {
                tracing::info!(%project, reason = %e, "spec skipped");
                true
            }
            Err(e) => {
                tracing::error!(%project, error = %e, "spec rejected");
                true
            }
        }
    }
}

fn is_project_file(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("projects/") else {
        return false;
    };
    !rest.contains('/') && (rest.ends_with(".yaml") || rest.ends_with(".yml"))
}

fn project_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_file_filter() {
        assert!(is_project_file("projects/demo.yaml"));
        assert!(is_project_file("projects/demo.yml"));
        assert!(!is_project_file("projects/demo/nested.yaml"));
        assert!(!is_project_file("README.md"));
        assert!(!is_project_file("other/demo.yaml"));
    }

    #[test]
    fn project_name_from_path() {
        assert_eq!(project_name("projects/demo.yaml"), "demo");
    }
}
