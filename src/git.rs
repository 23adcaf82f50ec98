//! Git operations for agent orchestration
//!
//! Worktree creation, checkpoint commits, diffing, and merge handling for
//! the repositories the fleet operates on. Uses direct CLI commands (no
//! libgit2) for simplicity and compatibility.

use color_eyre::eyre::{bail, Result, WrapErr};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Controller for git operations
pub struct GitController {
    /// Path to the main repository
    repo_path: PathBuf,
}

impl GitController {
    /// Create a new GitController for a repository
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    /// Check if the path is a git repository
    pub fn is_git_repo(&self) -> bool {
        self.repo_path.join(".git").exists()
    }

    /// Create a new worktree for isolated agent work
    ///
    /// # Arguments
    /// * `branch` - Name for the new branch (will be created)
    ///
    /// # Returns
    /// Path to the new worktree directory
    ///
    /// # Example
    /// ```ignore
    /// let git = GitController::new("/path/to/repo".into());
    /// let worktree_path = git.create_worktree("fix/auth-bug")?;
    /// // Worktree created at /path/to/repo-fix-auth-bug
    /// ```
    pub fn create_worktree(&self, branch: &str) -> Result<PathBuf> {
        if !self.is_git_repo() {
            bail!("Not a git repository: {}", self.repo_path.display());
        }

        // Sanitize branch name for directory
        let safe_branch = branch.replace(['/', '\\', ' '], "-");

        // Create worktree path: repo-branch
        let repo_name = self
            .repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");

        let worktree_name = format!("{repo_name}-{safe_branch}");
        let worktree_path = self
            .repo_path
            .parent()
            .unwrap_or(Path::new("/tmp"))
            .join(&worktree_name);

        // Check if worktree already exists
        if worktree_path.exists() {
            bail!("Worktree path already exists: {}", worktree_path.display());
        }

        // Create worktree with new branch
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args([
                "worktree",
                "add",
                worktree_path.to_str().unwrap(),
                "-b",
                branch,
            ])
            .output()
            .wrap_err("Failed to execute git worktree add")?;

        if !output.status.success() {
            bail!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        tracing::info!(
            branch = %branch,
            path = %worktree_path.display(),
            "Created git worktree"
        );

        Ok(worktree_path)
    }

    /// Create a checkpoint commit
    ///
    /// Stages all changes and creates a commit. Useful for periodic auto-saves.
    ///
    /// # Arguments
    /// * `message` - Commit message
    pub fn checkpoint(&self, message: &str) -> Result<()> {
        if !self.is_git_repo() {
            bail!("Not a git repository: {}", self.repo_path.display());
        }

        // Stage all changes
        let add_output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["add", "-A"])
            .output()
            .wrap_err("Failed to execute git add")?;

        if !add_output.status.success() {
            bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&add_output.stderr)
            );
        }

        // Check if there are changes to commit
        let status_output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["status", "--porcelain"])
            .output()
            .wrap_err("Failed to execute git status")?;

        if status_output.stdout.is_empty() {
            tracing::debug!("No changes to checkpoint");
            return Ok(());
        }

        // Create commit
        let commit_output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["commit", "-m", message])
            .output()
            .wrap_err("Failed to execute git commit")?;

        if !commit_output.status.success() {
            bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit_output.stderr)
            );
        }

        tracing::info!(message = %message, "Created checkpoint commit");
        Ok(())
    }

    /// Check if there are uncommitted changes
    pub fn has_changes(&self) -> Result<bool> {
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["status", "--porcelain"])
            .output()
            .wrap_err("Failed to check git status")?;

        Ok(!output.stdout.is_empty())
    }

    /// Get full git diff output (with actual changes)
    ///
    /// Returns the complete diff showing line-by-line changes.
    pub fn diff_full(&self) -> Result<String> {
        if !self.is_git_repo() {
            bail!("Not a git repository: {}", self.repo_path.display());
        }

        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["diff", "--color=never"])
            .output()
            .wrap_err("Failed to execute git diff")?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Push current branch to remote
    ///
    /// Pushes the current branch to the default remote (usually origin).
    /// Will fail if the branch has no upstream configured.
    pub fn push(&self) -> Result<()> {
        if !self.is_git_repo() {
            bail!("Not a git repository: {}", self.repo_path.display());
        }

        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["push"])
            .output()
            .wrap_err("Failed to execute git push")?;

        if !output.status.success() {
            bail!(
                "git push failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        tracing::info!(repo = %self.repo_path.display(), "Pushed to remote");
        Ok(())
    }

    /// Get the current HEAD commit hash
    ///
    /// Returns the short commit hash (7 chars) of HEAD.
    pub fn head_commit(&self) -> Result<String> {
        if !self.is_git_repo() {
            bail!("Not a git repository: {}", self.repo_path.display());
        }

        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["rev-parse", "--short", "HEAD"])
            .output()
            .wrap_err("Failed to execute git rev-parse")?;

        if !output.status.success() {
            bail!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Get diff since a specific commit
    ///
    /// Returns the diff from the given commit to HEAD (working tree).
    /// Includes both staged and unstaged changes.
    ///
    /// # Arguments
    /// * `commit` - Commit hash to diff from
    pub fn diff_since(&self, commit: &str) -> Result<String> {
        if !self.is_git_repo() {
            bail!("Not a git repository: {}", self.repo_path.display());
        }

        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["diff", "--color=never", commit])
            .output()
            .wrap_err("Failed to execute git diff")?;

        if !output.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Show the patch and stat of a single commit, for rendering a review prompt.
    pub fn show_commit(&self, commit: &str) -> Result<String> {
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["show", "--patch", "--stat", "--color=never", commit])
            .output()
            .wrap_err("Failed to execute git show")?;

        if !output.status.success() {
            bail!(
                "git show failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Find the most recent commit reachable from HEAD whose message contains `marker`.
    pub fn find_commit_with_marker(&self, marker: &str) -> Result<Option<String>> {
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["log", "--format=%H %s", "-n", "50"])
            .output()
            .wrap_err("Failed to execute git log")?;

        if !output.status.success() {
            bail!("git log failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            if line.contains(marker) {
                if let Some((hash, _)) = line.split_once(' ') {
                    return Ok(Some(hash.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let status = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .status()
            .wrap_err("Failed to execute git merge-base")?;
        Ok(status.success())
    }

    /// Resolve the project's default/target branch: `origin/HEAD` symbolic ref,
    /// falling back to the current branch, falling back to `main`.
    pub fn default_branch(&self) -> Result<String> {
        let symbolic = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .output();
        if let Ok(out) = symbolic {
            if out.status.success() {
                let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if let Some(branch) = name.strip_prefix("origin/") {
                    return Ok(branch.to_string());
                }
            }
        }

        let current = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .output()
            .wrap_err("Failed to execute git rev-parse")?;
        if current.status.success() {
            let name = String::from_utf8_lossy(&current.stdout).trim().to_string();
            if !name.is_empty() && name != "HEAD" {
                return Ok(name);
            }
        }

        Ok("main".to_string())
    }

    /// Check out `branch` and merge `source` into it with `--no-ff --no-edit`.
    ///
    /// On conflict, aborts the merge and returns the list of conflicted files
    /// (via `git diff --name-only --diff-filter=U`) rather than an error, so
    /// the caller can route a resolution prompt instead of treating this as fatal.
    pub fn merge_branch(&self, branch: &str, source: &str) -> Result<MergeOutcome> {
        let checkout = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["checkout", branch])
            .output()
            .wrap_err("Failed to execute git checkout")?;
        if !checkout.status.success() {
            bail!(
                "git checkout {branch} failed: {}",
                String::from_utf8_lossy(&checkout.stderr)
            );
        }

        let merge = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["merge", "--no-ff", "--no-edit", source])
            .output()
            .wrap_err("Failed to execute git merge")?;

        if merge.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let conflicts = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["diff", "--name-only", "--diff-filter=U"])
            .output()
            .wrap_err("Failed to execute git diff --diff-filter=U")?;
        let files = String::from_utf8_lossy(&conflicts.stdout)
            .lines()
            .map(str::to_string)
            .collect();

        Command::new("git")
            .current_dir(&self.repo_path)
            .args(["merge", "--abort"])
            .output()
            .wrap_err("Failed to execute git merge --abort")?;

        Ok(MergeOutcome::Conflict { files })
    }
}

/// Result of attempting a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict { files: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, GitController) {
        let tmp = TempDir::new().unwrap();
        let repo_path = tmp.path().to_path_buf();

        // Initialize git repo
        Command::new("git")
            .current_dir(&repo_path)
            .args(["init"])
            .output()
            .unwrap();

        // Configure git for tests
        Command::new("git")
            .current_dir(&repo_path)
            .args(["config", "user.email", "test@test.com"])
            .output()
            .unwrap();

        Command::new("git")
            .current_dir(&repo_path)
            .args(["config", "user.name", "Test User"])
            .output()
            .unwrap();

        // Create initial commit
        std::fs::write(repo_path.join("README.md"), "# Test").unwrap();
        Command::new("git")
            .current_dir(&repo_path)
            .args(["add", "README.md"])
            .output()
            .unwrap();
        Command::new("git")
            .current_dir(&repo_path)
            .args(["commit", "-m", "Initial commit"])
            .output()
            .unwrap();

        let git = GitController::new(repo_path);
        (tmp, git)
    }

    #[test]
    fn test_is_git_repo() {
        let (_tmp, git) = setup_test_repo();
        assert!(git.is_git_repo());
    }

    #[test]
    fn test_checkpoint() {
        let (tmp, git) = setup_test_repo();

        // Make a change
        std::fs::write(tmp.path().join("new_file.txt"), "test content").unwrap();

        // Verify there are changes
        assert!(git.has_changes().unwrap());

        // Create checkpoint
        git.checkpoint("Test checkpoint").unwrap();

        // No more changes
        assert!(!git.has_changes().unwrap());
    }

    #[test]
    fn test_checkpoint_no_changes() {
        let (_tmp, git) = setup_test_repo();

        // No changes to commit
        assert!(!git.has_changes().unwrap());

        // Checkpoint should succeed silently
        git.checkpoint("Empty checkpoint").unwrap();
    }

    #[test]
    fn test_merge_clean() {
        let (tmp, git) = setup_test_repo();
        let repo_path = tmp.path();

        Command::new("git")
            .current_dir(repo_path)
            .args(["checkout", "-b", "feature"])
            .output()
            .unwrap();
        std::fs::write(repo_path.join("feature.txt"), "hi").unwrap();
        Command::new("git")
            .current_dir(repo_path)
            .args(["add", "-A"])
            .output()
            .unwrap();
        Command::new("git")
            .current_dir(repo_path)
            .args(["commit", "-m", "feature work"])
            .output()
            .unwrap();

        let outcome = git.merge_branch("master", "feature").unwrap_or_else(|_| {
            git.merge_branch("main", "feature").unwrap()
        });
        assert_eq!(outcome, MergeOutcome::Merged);
    }

    #[test]
    fn test_merge_conflict() {
        let (tmp, git) = setup_test_repo();
        let repo_path = tmp.path();

        let default_branch = git.default_branch().unwrap();

        Command::new("git")
            .current_dir(repo_path)
            .args(["checkout", "-b", "feature"])
            .output()
            .unwrap();
        std::fs::write(repo_path.join("README.md"), "# Feature").unwrap();
        Command::new("git")
            .current_dir(repo_path)
            .args(["commit", "-am", "feature edit"])
            .output()
            .unwrap();

        Command::new("git")
            .current_dir(repo_path)
            .args(["checkout", &default_branch])
            .output()
            .unwrap();
        std::fs::write(repo_path.join("README.md"), "# Main").unwrap();
        Command::new("git")
            .current_dir(repo_path)
            .args(["commit", "-am", "main edit"])
            .output()
            .unwrap();

        let outcome = git.merge_branch(&default_branch, "feature").unwrap();
        match outcome {
            MergeOutcome::Conflict { files } => {
                assert_eq!(files, vec!["README.md".to_string()]);
            }
            MergeOutcome::Merged => panic!("expected conflict"),
        }
    }
}
