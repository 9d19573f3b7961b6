use std::path::Path;

use super::PublishError;

/// Run a git command, optionally inside a repository directory.
/// Non-zero exit surfaces stderr, the way all subprocess helpers here do.
pub async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, PublishError> {
    let mut cmd = tokio::process::Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    let output = cmd
        .args(args)
        .output()
        .await
        .map_err(|e| PublishError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PublishError::Git(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub async fn clone_repo(url: &str, branch: &str, dest: &Path) -> Result<(), PublishError> {
    run_git(
        None,
        &[
            "clone",
            "--branch",
            branch,
            url,
            &dest.to_string_lossy(),
        ],
    )
    .await?;
    Ok(())
}

/// Bring an existing working copy to the remote head: fetch + hard reset.
pub async fn sync_to_remote(dir: &Path, branch: &str) -> Result<(), PublishError> {
    run_git(Some(dir), &["fetch", "origin", branch]).await?;
    run_git(Some(dir), &["reset", "--hard", &format!("origin/{branch}")]).await?;
    run_git(Some(dir), &["clean", "-fd"]).await?;
    Ok(())
}

pub async fn head_sha(dir: &Path) -> Result<String, PublishError> {
    Ok(run_git(Some(dir), &["rev-parse", "HEAD"]).await?.trim().to_owned())
}

/// File paths changed between two commits.
pub async fn changed_files(dir: &Path, old: &str, new: &str) -> Result<Vec<String>, PublishError> {
    let out = run_git(Some(dir), &["diff", "--name-only", &format!("{old}..{new}")]).await?;
    Ok(out.lines().map(str::to_owned).collect())
}

/// Tracked files under a path prefix at HEAD.
pub async fn ls_files(dir: &Path, prefix: &str) -> Result<Vec<String>, PublishError> {
    let out = run_git(Some(dir), &["ls-files", "--", prefix]).await?;
    Ok(out.lines().map(str::to_owned).collect())
}

/// Whether the working tree has anything to commit.
pub async fn has_changes(dir: &Path) -> Result<bool, PublishError> {
    let out = run_git(Some(dir), &["status", "--porcelain"]).await?;
    Ok(!out.trim().is_empty())
}

pub async fn stage_all(dir: &Path) -> Result<(), PublishError> {
    run_git(Some(dir), &["add", "--all"]).await?;
    Ok(())
}

pub async fn commit(dir: &Path, message: &str) -> Result<(), PublishError> {
    run_git(
        Some(dir),
        &[
            "-c",
            "user.name=launchpad",
            "-c",
            "user.email=launchpad@localhost",
            "commit",
            "-m",
            message,
        ],
    )
    .await?;
    Ok(())
}

/// Push, distinguishing non-fast-forward rejection so the caller can replay.
pub async fn push(dir: &Path, refspec: &str, force: bool) -> Result<(), PublishError> {
    let mut args = vec!["push", "origin", refspec];
    if force {
        args.insert(1, "--force");
    }
    match run_git(Some(dir), &args).await {
        Ok(_) => Ok(()),
        Err(PublishError::Git(msg)) if is_non_fast_forward(&msg) => {
            Err(PublishError::NonFastForward(msg))
        }
        Err(e) => Err(e),
    }
}

fn is_non_fast_forward(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("non-fast-forward") || s.contains("fetch first") || s.contains("stale info")
}
