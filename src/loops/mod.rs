//! Automation Loops scaffolding
//!
//! Shared ticker and per-project advisory locking used by the three
//! cooperating loops (`auto_commit`, `coordinator`, `merge_controller`).
//! Each loop owns its own polling interval and state; this module only
//! provides the pieces they have in common so every loop doesn't hand-roll
//! its own lock map.

pub mod auto_commit;
pub mod coordinator;
pub mod merge_controller;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// One advisory lock per project id, handed out so automation loops never
/// race each other (e.g. a merge attempt and an auto-commit) on the same
/// working tree.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Word-boundary match for "APPROVED" or "LGTM", rejecting a match directly
/// preceded by "not "/"NOT " (case-insensitive). Implemented as a plain scan
/// rather than pulling in `regex` for one fixed pattern.
pub fn contains_approval_verdict(text: &str) -> bool {
    let upper = text.to_uppercase();
    for needle in ["APPROVED", "LGTM"] {
        let mut start = 0;
        while let Some(pos) = upper[start..].find(needle) {
            let abs = start + pos;
            let before_is_boundary = abs == 0 || !upper.as_bytes()[abs - 1].is_ascii_alphanumeric();
            let after = abs + needle.len();
            let after_is_boundary =
                after >= upper.len() || !upper.as_bytes()[after].is_ascii_alphanumeric();
            if before_is_boundary && after_is_boundary {
                let preceding = &upper[..abs];
                let negated = preceding.ends_with("NOT ");
                if !negated {
                    return true;
                }
            }
            start = abs + needle.len();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_approved_matches() {
        assert!(contains_approval_verdict("Looks good. APPROVED."));
    }

    #[test]
    fn test_negated_approved_does_not_match() {
        assert!(!contains_approval_verdict("This is not approved, please fix the tests."));
    }

    #[test]
    fn test_lgtm_matches() {
        assert!(contains_approval_verdict("lgtm, ship it"));
    }

    #[test]
    fn test_substring_does_not_match() {
        assert!(!contains_approval_verdict("UNAPPROVED changes detected"));
    }
}
