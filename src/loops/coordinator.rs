//! Coordinator
//!
//! Pairs a coder session with a reviewer session per task, forwards the
//! ready-for-review diff, parses the reviewer's verdict, and loops until
//! approval or an iteration cap. The verdict detector is
//! `contains_approval_verdict` (word-boundary `APPROVED`/`LGTM`, rejecting a
//! `not `/`NOT `-preceded match) — see the Open Question decision in
//! DESIGN.md.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::git::GitController;
use crate::lifecycle::LifecycleManager;
use crate::loops::contains_approval_verdict;
use crate::store::Store;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
const REVIEW_WAIT: Duration = Duration::from_secs(120);
const MAX_ITERATIONS: u32 = 3;

pub enum CoordinatorOutcome {
    Approved,
    Feedback(String),
    TimedOut,
    IterationCapReached,
}

/// One review cycle for a (coder, reviewer) pair already sitting at a
/// ready-for-review commit. Sends the review prompt, waits for reviewer
/// output, and classifies the verdict.
pub async fn run_review_cycle(
    lifecycle: &LifecycleManager,
    repo_path: &std::path::Path,
    commit_hash: &str,
    task_spec: &str,
    reviewer_session_id: &str,
) -> color_eyre::eyre::Result<CoordinatorOutcome> {
    let git = GitController::new(repo_path.to_path_buf());
    let diff = git.show_commit(commit_hash)?;
    let prompt = format!("{task_spec}\n\n--- commit {commit_hash} ---\n{diff}\n");
    lifecycle.send_command(reviewer_session_id, &prompt).await?;

    let deadline = tokio::time::Instant::now() + REVIEW_WAIT;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Ok(CoordinatorOutcome::TimedOut);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        let output = lifecycle.get_output(reviewer_session_id, 50).await;
        let text = output.join("\n");
        if text.trim().is_empty() {
            continue;
        }
        if contains_approval_verdict(&text) {
            return Ok(CoordinatorOutcome::Approved);
        }
        // Any substantial non-empty reviewer output that isn't an approval
        // is treated as feedback to forward to the coder.
        return Ok(CoordinatorOutcome::Feedback(text));
    }
}

/// Runs one full coordinator iteration loop for a task: forwards feedback
/// back to the coder and re-reviews, up to `MAX_ITERATIONS`, recording each
/// verdict via `Store::record_review`.
pub async fn drive_task_to_verdict(
    lifecycle: &LifecycleManager,
    store: &Mutex<Store>,
    repo_path: &std::path::Path,
    task_id: &str,
    task_spec: &str,
    coder_session_id: &str,
    reviewer_session_id: &str,
    mut next_commit: impl FnMut() -> Option<String>,
    cancel: &CancellationToken,
) -> color_eyre::eyre::Result<CoordinatorOutcome> {
    let mut iteration: i64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(CoordinatorOutcome::TimedOut);
        }
        let Some(commit_hash) = next_commit() else {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        iteration += 1;
        if iteration as u32 > MAX_ITERATIONS {
            return Ok(CoordinatorOutcome::IterationCapReached);
        }

        let outcome = run_review_cycle(lifecycle, repo_path, &commit_hash, task_spec, reviewer_session_id).await?;

        match &outcome {
            CoordinatorOutcome::Approved => {
                let store = store.lock().await;
                store.record_review(task_id, iteration, "approved", "")?;
                if let Some(mut task) = store.get_task(task_id)? {
                    task.status = "completed".to_string();
                    store.upsert_task(&task)?;
                }
                return Ok(outcome);
            }
            CoordinatorOutcome::Feedback(text) => {
                store.lock().await.record_review(task_id, iteration, "changes_requested", text)?;
                lifecycle
                    .send_command(coder_session_id, &format!("Reviewer feedback:\n{text}"))
                    .await?;
            }
            CoordinatorOutcome::TimedOut | CoordinatorOutcome::IterationCapReached => {
                return Ok(outcome);
            }
        }
    }
}

/// A coder/reviewer pair bound to one task, as resolved by whoever owns
/// session assignment (the orchestrator or the lifecycle manager).
#[derive(Clone)]
pub struct ReviewPair {
    pub project_id: String,
    pub task_id: String,
    pub repo_path: std::path::PathBuf,
    pub task_spec: String,
    pub coder_session_id: String,
    pub reviewer_session_id: String,
}

/// Shared registry of the latest `[READY_FOR_REVIEW]` commit seen per task,
/// populated by the auto-committer's `on_ready` callback and drained here.
/// A plain `std::sync::Mutex` since both sides only ever hold it for a
/// single map lookup and `drive_task_to_verdict`'s `next_commit` callback
/// is synchronous.
#[derive(Default, Clone)]
pub struct ReadyCommits(Arc<std::sync::Mutex<HashMap<String, String>>>);

impl ReadyCommits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self, task_id: &str, commit_hash: &str) {
        self.0.lock().unwrap().insert(task_id.to_string(), commit_hash.to_string());
    }

    /// Takes the pending commit for a task, if one hasn't already been
    /// consumed by a prior review cycle.
    fn take(&self, task_id: &str) -> Option<String> {
        self.0.lock().unwrap().remove(task_id)
    }
}

/// Polls every `POLL_INTERVAL` for review pairs not already being
/// monitored and not paused (human-attached), and spawns one
/// `drive_task_to_verdict` coroutine per pair. A pair is considered done
/// monitoring once its coroutine returns, at which point it may be
/// re-matched on a later pass (e.g. a new task reusing the same agents).
pub async fn run(
    lifecycle: Arc<LifecycleManager>,
    store: Arc<Mutex<Store>>,
    pairs: impl Fn() -> Vec<ReviewPair> + Send + Sync + 'static,
    is_paused: impl Fn(&str) -> bool + Send + Sync + 'static,
    ready: ReadyCommits,
    on_completed: impl Fn(&str, &str, bool) + Send + Sync + 'static,
    cancel: CancellationToken,
) {
    let on_completed = Arc::new(on_completed);
    let monitored: Arc<std::sync::Mutex<HashSet<String>>> = Arc::new(std::sync::Mutex::new(HashSet::new()));
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                for pair in pairs() {
                    if is_paused(&pair.task_id) {
                        continue;
                    }
                    {
                        let mut guard = monitored.lock().unwrap();
                        if guard.contains(&pair.task_id) {
                            continue;
                        }
                        guard.insert(pair.task_id.clone());
                    }

                    let lifecycle = lifecycle.clone();
                    let store = store.clone();
                    let ready = ready.clone();
                    let monitored = monitored.clone();
                    let on_completed = on_completed.clone();
                    let task_cancel = cancel.clone();
                    tokio::spawn(async move {
                        let task_id = pair.task_id.clone();
                        let project_id = pair.project_id.clone();
                        let result = drive_task_to_verdict(
                            &lifecycle,
                            &store,
                            &pair.repo_path,
                            &task_id,
                            &pair.task_spec,
                            &pair.coder_session_id,
                            &pair.reviewer_session_id,
                            {
                                let ready = ready.clone();
                                let task_id = task_id.clone();
                                move || ready.take(&task_id)
                            },
                            &task_cancel,
                        )
                        .await;
                        monitored.lock().unwrap().remove(&task_id);
                        match result {
                            Ok(CoordinatorOutcome::Approved) => on_completed(&project_id, &task_id, true),
                            Ok(_) => on_completed(&project_id, &task_id, false),
                            Err(e) => {
                                tracing::warn!(task_id, error = %e, "coordinator monitor failed");
                                on_completed(&project_id, &task_id, false);
                            }
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approved_outcome_is_terminal() {
        assert!(contains_approval_verdict("APPROVED"));
    }

    #[test]
    fn test_ready_commits_take_once() {
        let ready = ReadyCommits::new();
        ready.mark_ready("t1", "abc123");
        assert_eq!(ready.take("t1"), Some("abc123".to_string()));
        assert_eq!(ready.take("t1"), None);
    }
}
