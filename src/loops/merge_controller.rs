//! Merge Controller
//!
//! For each completed task whose worktree is not yet merged and has no
//! attached human session, resolves the project's default branch and
//! attempts a `--no-ff` merge. On conflict, aborts, reverts the task to
//! pending, and routes the coder session a resolution prompt — unless this
//! exact source commit was already notified. Built directly on
//! `git::GitController::{default_branch, is_ancestor, merge_branch}`.

use std::time::Duration;

use color_eyre::eyre::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::git::{GitController, MergeOutcome};
use crate::lifecycle::LifecycleManager;
use crate::loops::ProjectLocks;
use crate::store::Store;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct MergeCandidate {
    pub project_id: String,
    pub task_id: String,
    pub worktree_id: String,
    pub repo_path: std::path::PathBuf,
    pub branch: String,
    pub coder_session_id: Option<String>,
    pub human_attached: bool,
}

pub enum MergeResult {
    AlreadyAncestor,
    Merged,
    Conflict { files: Vec<String> },
    Skipped,
}

/// One merge attempt for a single candidate, under the project's advisory lock.
///
/// On success, marks the worktree `merged` so it drops out of future
/// candidate scans. On conflict, reverts the task to `pending` so it
/// re-enters the coordinator/auto-commit cycle once the coder resolves it.
pub async fn attempt_merge(
    locks: &ProjectLocks,
    lifecycle: &LifecycleManager,
    store: &Mutex<Store>,
    candidate: &MergeCandidate,
    already_notified: impl Fn(&str) -> bool,
) -> Result<MergeResult> {
    if candidate.human_attached {
        return Ok(MergeResult::Skipped);
    }

    let lock = locks.lock_for(&candidate.project_id).await;
    let _guard = lock.lock().await;

    let git = GitController::new(candidate.repo_path.clone());
    let target = git.default_branch()?;
    let source_commit = git.head_commit()?;

    if git.is_ancestor(&source_commit, &target)? {
        return Ok(MergeResult::AlreadyAncestor);
    }

    match git.merge_branch(&target, &candidate.branch)? {
        MergeOutcome::Merged => {
            let store = store.lock().await;
            if let Some(mut worktree) = store.get_worktree(&candidate.worktree_id)? {
                worktree.status = "merged".to_string();
                store.upsert_worktree(&worktree)?;
            }
            Ok(MergeResult::Merged)
        }
        MergeOutcome::Conflict { files } => {
            if !already_notified(&source_commit) {
                if let Some(session_id) = &candidate.coder_session_id {
                    let prompt = format!(
                        "Merge conflict detected merging {} into {}: {}\nPlease resolve and recommit.",
                        candidate.branch,
                        target,
                        files.join(", ")
                    );
                    lifecycle.send_command(session_id, &prompt).await?;
                }
            }
            let store = store.lock().await;
            if let Some(mut task) = store.get_task(&candidate.task_id)? {
                task.status = "pending".to_string();
                store.upsert_task(&task)?;
            }
            Ok(MergeResult::Conflict { files })
        }
    }
}

pub async fn run(
    locks: &ProjectLocks,
    lifecycle: &LifecycleManager,
    store: &Mutex<Store>,
    candidates: impl Fn() -> Vec<MergeCandidate> + Send + Sync + 'static,
    notified: &Mutex<std::collections::HashSet<String>>,
    on_merged: impl Fn(&str, &str) + Send + Sync,
    on_conflict: impl Fn(&str, &str, &[String]) + Send + Sync,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(DEFAULT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                for candidate in candidates() {
                    let already: std::collections::HashSet<String> = notified.lock().await.clone();
                    let result = attempt_merge(locks, lifecycle, store, &candidate, |c| already.contains(c)).await;
                    match result {
                        Ok(MergeResult::Merged) | Ok(MergeResult::AlreadyAncestor) => {
                            on_merged(&candidate.project_id, &candidate.task_id);
                        }
                        Ok(MergeResult::Conflict { files }) => {
                            if let Ok(head) = GitController::new(candidate.repo_path.clone()).head_commit() {
                                notified.lock().await.insert(head);
                            }
                            on_conflict(&candidate.project_id, &candidate.task_id, &files);
                        }
                        Ok(MergeResult::Skipped) => {}
                        Err(e) => tracing::warn!(task_id = %candidate.task_id, error = %e, "merge attempt failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_repo_with_feature() -> (TempDir, String) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path();
        Command::new("git").current_dir(path).args(["init"]).output().unwrap();
        Command::new("git")
            .current_dir(path)
            .args(["config", "user.email", "t@t.com"])
            .output()
            .unwrap();
        Command::new("git")
            .current_dir(path)
            .args(["config", "user.name", "T"])
            .output()
            .unwrap();
        std::fs::write(path.join("README.md"), "# hi").unwrap();
        Command::new("git").current_dir(path).args(["add", "-A"]).output().unwrap();
        Command::new("git")
            .current_dir(path)
            .args(["commit", "-m", "init"])
            .output()
            .unwrap();
        Command::new("git")
            .current_dir(path)
            .args(["checkout", "-b", "feature"])
            .output()
            .unwrap();
        std::fs::write(path.join("feature.txt"), "hi").unwrap();
        Command::new("git").current_dir(path).args(["add", "-A"]).output().unwrap();
        Command::new("git")
            .current_dir(path)
            .args(["commit", "-m", "feature work"])
            .output()
            .unwrap();
        (tmp, "feature".to_string())
    }

    #[test]
    fn test_default_branch_resolves_without_remote() {
        let (tmp, _) = setup_repo_with_feature();
        let git = GitController::new(tmp.path().to_path_buf());
        let branch = git.default_branch().unwrap();
        assert_eq!(branch, "feature");
    }
}
