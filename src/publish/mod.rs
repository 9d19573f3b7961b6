pub mod git;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::PublishMode;
use crate::model::GitCommitRecord;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("git operation failed: {0}")]
    Git(String),

    /// Push rejected because the remote moved; retried internally.
    #[error("push rejected (non-fast-forward): {0}")]
    NonFastForward(String),

    /// Non-fast-forward persisted through the bounded retry cycle.
    #[error("publish conflict: remote diverged after {0} clone-modify-push attempts")]
    Conflict(u32),

    #[error("merge request call failed: {0}")]
    MergeRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

const PUSH_ATTEMPTS: u32 = 3;

/// Result of one publish call. `commit` is None when the generated files
/// matched the repository exactly (no-op, nothing committed).
#[derive(Debug)]
pub struct PublishOutcome {
    pub commit: Option<GitCommitRecord>,
}

/// Serialized writer for one GitOps repository.
///
/// Two independent writers racing on the same repository+branch is the
/// documented failure mode here: every clone-modify-commit-push cycle runs
/// under the per-repository lock, and concurrent publishers queue on it.
pub struct GitPublisher {
    workdir: PathBuf,
    repo_url: String,
    branch: String,
    mode: PublishMode,
    merge_request_endpoint: Option<String>,
    http: reqwest::Client,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl GitPublisher {
    pub fn new(
        workdir: &Path,
        repo_url: &str,
        branch: &str,
        mode: PublishMode,
        merge_request_endpoint: Option<&str>,
    ) -> Self {
        Self {
            workdir: workdir.to_owned(),
            repo_url: repo_url.to_owned(),
            branch: branch.to_owned(),
            mode,
            merge_request_endpoint: merge_request_endpoint.map(std::borrow::ToOwned::to_owned),
            http: reqwest::Client::new(),
            locks: DashMap::new(),
        }
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn checkout_dir(&self) -> PathBuf {
        self.workdir.join("gitops")
    }

    /// Clone on first use, fetch + hard reset afterwards.
    async fn sync_working_copy(&self, dir: &Path) -> Result<(), PublishError> {
        if dir.join(".git").exists() {
            git::sync_to_remote(dir, &self.branch).await
        } else {
            tokio::fs::create_dir_all(
                dir.parent().unwrap_or_else(|| Path::new(".")),
            )
            .await?;
            git::clone_repo(&self.repo_url, &self.branch, dir).await
        }
    }

    /// Publish a file set for a project: write `files`, delete `removals`,
    /// commit with the given deterministic message, push. Retries the whole
    /// clone-modify-push cycle on non-fast-forward rejection up to a fixed
    /// bound, then surfaces [`PublishError::Conflict`].
    #[tracing::instrument(skip(self, files, removals), fields(%project, file_count = files.len()), err)]
    pub async fn publish(
        &self,
        project: &str,
        files: &BTreeMap<String, String>,
        removals: &[String],
        message: &str,
    ) -> Result<PublishOutcome, PublishError> {
        let lock = self.lock_for(&self.repo_url);
        let _guard = lock.lock().await;

        let dir = self.checkout_dir();

        for attempt in 1..=PUSH_ATTEMPTS {
            self.sync_working_copy(&dir).await?;

            // Re-apply the modifications on every attempt; a reset threw the
            // previous round away.
            for (path, content) in files {
                let full = dir.join(path);
                if let Some(parent) = full.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&full, content).await?;
            }
            for path in removals {
                let full = dir.join(path);
                if full.is_dir() {
                    tokio::fs::remove_dir_all(&full).await?;
                } else if full.exists() {
                    tokio::fs::remove_file(&full).await?;
                }
            }

            if !git::has_changes(&dir).await? {
                tracing::info!(%project, "no changes against repository, skipping commit");
                return Ok(PublishOutcome { commit: None });
            }

            git::stage_all(&dir).await?;
            git::commit(&dir, message).await?;
            let sha = git::head_sha(&dir).await?;

            let push_result = match self.mode {
                PublishMode::Direct => git::push(&dir, &self.branch, false).await,
                PublishMode::MergeRequest => {
                    let mr_branch = format!("launchpad/{project}");
                    git::run_git(Some(&dir), &["branch", "-f", &mr_branch, "HEAD"]).await?;
                    git::push(&dir, &format!("{mr_branch}:{mr_branch}"), true).await
                }
            };

            match push_result {
                Ok(()) => {
                    if self.mode == PublishMode::MergeRequest {
                        self.open_merge_request(project, message).await?;
                    }
                    tracing::info!(%project, commit = %sha, "artifacts published");
                    return Ok(PublishOutcome {
                        commit: Some(GitCommitRecord {
                            repository: self.repo_url.clone(),
                            branch: self.branch.clone(),
                            commit: sha,
                            files: files.keys().cloned().collect(),
                        }),
                    });
                }
                Err(PublishError::NonFastForward(msg)) => {
                    tracing::warn!(%project, attempt, error = %msg, "push rejected, replaying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(PublishError::Conflict(PUSH_ATTEMPTS))
    }

    /// Remove a project's artifact directory. Absence is success.
    pub async fn remove_project(&self, project: &str) -> Result<PublishOutcome, PublishError> {
        self.publish(
            project,
            &BTreeMap::new(),
            &[format!("projects/{project}")],
            &format!("launchpad: delete {project}"),
        )
        .await
    }

    /// Files currently published for a project.
    pub async fn published_files(&self, project: &str) -> Result<Vec<String>, PublishError> {
        let lock = self.lock_for(&self.repo_url);
        let _guard = lock.lock().await;

        let dir = self.checkout_dir();
        self.sync_working_copy(&dir).await?;
        git::ls_files(&dir, &format!("projects/{project}")).await
    }

    async fn open_merge_request(&self, project: &str, title: &str) -> Result<(), PublishError> {
        let Some(endpoint) = &self.merge_request_endpoint else {
            return Ok(());
        };

        let body = serde_json::json!({
            "title": title,
            "source_branch": format!("launchpad/{project}"),
            "target_branch": self.branch,
        });

        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::MergeRequest(e.to_string()))?;

        // An already-open merge request for the branch is fine.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::CONFLICT {
            return Err(PublishError::MergeRequest(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
