//! System prompt composition.
//!
//! Builds the orchestrator's system prompt from project state: role framing,
//! current status, available agents, matched playbook phases, and the fixed
//! rule list every lane must obey.

use crate::playbook::Playbook;
use crate::store::{ProjectRecord, TaskRecord};

const RULES: &[&str] = &[
    "Never act on a session with human_attached = true.",
    "Prefer parallelism across independent tasks over serial execution.",
    "Never commit destructive actions without explicit approval.",
];

/// Which half of the orchestrator this system prompt is composed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Mutating tools: creates sessions, merges, writes.
    Execution,
    /// Read-only tools: answers questions about project state.
    Demand,
}

impl Lane {
    fn role_framing(self) -> &'static str {
        match self {
            Lane::Execution => {
                "You are a software project manager driving a fleet of coding agents toward task completion."
            }
            Lane::Demand => {
                "You are a software project manager answering questions about the current state of the project. You do not take mutating actions."
            }
        }
    }
}

pub fn compose_system_prompt(
    lane: Lane,
    project: &ProjectRecord,
    playbook: Option<&Playbook>,
    tasks: &[TaskRecord],
    recent_history: &[(String, String)],
) -> String {
    let mut sections = Vec::new();
    sections.push(lane.role_framing().to_string());

    sections.push(format!(
        "Project: {} ({}), status: {}",
        project.name, project.repo_path, project.status
    ));

    if let Some(pb) = playbook {
        let stage_names: Vec<&str> = pb.stages.iter().map(|s| s.name.as_str()).collect();
        sections.push(format!("Playbook \"{}\" stages: {}", pb.name, stage_names.join(" -> ")));
    }

    if !tasks.is_empty() {
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| format!("- {} [{}]: {}", t.id, t.status, t.title))
            .collect();
        sections.push(format!("Current tasks:\n{}", lines.join("\n")));
    }

    if !recent_history.is_empty() {
        let lines: Vec<String> = recent_history
            .iter()
            .map(|(role, content)| format!("{role}: {content}"))
            .collect();
        sections.push(format!("Recent history:\n{}", lines.join("\n")));
    }

    sections.push(format!("Rules:\n{}", RULES.iter().map(|r| format!("- {r}")).collect::<Vec<_>>().join("\n")));

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_includes_rules_and_project() {
        let project = ProjectRecord {
            id: "p1".into(),
            name: "demo".into(),
            repo_path: "/tmp/demo".into(),
            status: "active".into(),
            playbook_id: None,
        };
        let prompt = compose_system_prompt(Lane::Execution, &project, None, &[], &[]);
        assert!(prompt.contains("demo"));
        assert!(prompt.contains("Never act on a session with human_attached"));
    }

    #[test]
    fn test_demand_lane_framing_differs() {
        let project = ProjectRecord {
            id: "p1".into(),
            name: "demo".into(),
            repo_path: "/tmp/demo".into(),
            status: "active".into(),
            playbook_id: None,
        };
        let exec = compose_system_prompt(Lane::Execution, &project, None, &[], &[]);
        let demand = compose_system_prompt(Lane::Demand, &project, None, &[], &[]);
        assert_ne!(exec, demand);
        assert!(demand.contains("do not take mutating actions"));
    }
}
