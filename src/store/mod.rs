//! Persistent store
//!
//! A thin `rusqlite` wrapper mirroring the data-model entities: projects,
//! worktrees, tasks, sessions, agent profiles, playbooks, orchestrator
//! history, runs, role-loop attempts, review records. Schema-on-read: the
//! schema owns foreign keys and indices, callers decide what subset of
//! columns they need per query rather than the store pre-joining views.
//!
//! Multi-row mutations (e.g. creating a project together with its default
//! orchestrator profile) run inside a single `rusqlite::Transaction` so a
//! sub-step failure rolls back the whole action.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{AgentermError, Result};

pub struct Store {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    pub status: String,
    pub playbook_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeRecord {
    pub id: String,
    pub project_id: String,
    pub branch: String,
    pub path: String,
    pub status: String,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: String,
    pub worktree_id: Option<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    /// `None` for a viewer-initiated ad-hoc shell not bound to any task.
    pub task_id: Option<String>,
    pub agent_profile_id: String,
    pub role: String,
    pub status: String,
    pub human_attached: bool,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentermError::StoreError(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repo_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                playbook_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS worktrees (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                branch TEXT NOT NULL,
                path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                task_id TEXT,
                UNIQUE(project_id, branch)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                worktree_id TEXT REFERENCES worktrees(id),
                depends_on TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                task_id TEXT REFERENCES tasks(id),
                agent_profile_id TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                human_attached INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_activity_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS orchestrator_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL REFERENCES projects(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                lane TEXT NOT NULL,
                started_at TEXT NOT NULL DEFAULT (datetime('now')),
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS role_loop_attempts (
                task_id TEXT NOT NULL,
                role TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (task_id, role)
            );

            CREATE TABLE IF NOT EXISTS review_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                iteration INTEGER NOT NULL,
                verdict TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_worktrees_project ON worktrees(project_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id);
            ",
        )?;
        Ok(())
    }

    /// Atomically creates a project plus its default role-loop-attempt ledger
    /// row, so a sub-step failure leaves no orphaned project record.
    pub fn create_project_with_default_orchestrator(
        &mut self,
        project: &ProjectRecord,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO projects (id, name, repo_path, status, playbook_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project.id, project.name, project.repo_path, project.status, project.playbook_id],
        )?;
        tx.execute(
            "INSERT INTO orchestrator_history (project_id, role, content) VALUES (?1, 'system', '')",
            params![project.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tasks (id, project_id, title, status, worktree_id, depends_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                worktree_id = COALESCE(excluded.worktree_id, tasks.worktree_id),
                depends_on = excluded.depends_on",
            params![
                task.id,
                task.project_id,
                task.title,
                task.status,
                task.worktree_id,
                task.depends_on.join(",")
            ],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, repo_path, status, playbook_id FROM projects")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProjectRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                repo_path: row.get(2)?,
                status: row.get(3)?,
                playbook_id: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>> {
        self.conn
            .query_row(
                "SELECT id, name, repo_path, status, playbook_id FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ProjectRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        repo_path: row.get(2)?,
                        status: row.get(3)?,
                        playbook_id: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Every task in a project, regardless of status — callers filter for
    /// the status they care about (the scanner's transition detector wants
    /// all of them; most other callers want one status).
    pub fn list_tasks(&self, project_id: &str) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, title, status, worktree_id, depends_on FROM tasks WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            let depends_on: String = row.get(5)?;
            Ok(TaskRecord {
                id: row.get(0)?,
                project_id: row.get(1)?,
                title: row.get(2)?,
                status: row.get(3)?,
                worktree_id: row.get(4)?,
                depends_on: depends_on
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_worktree(&self, id: &str) -> Result<Option<WorktreeRecord>> {
        self.conn
            .query_row(
                "SELECT id, project_id, branch, path, status, task_id FROM worktrees WHERE id = ?1",
                params![id],
                |row| {
                    Ok(WorktreeRecord {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        branch: row.get(2)?,
                        path: row.get(3)?,
                        status: row.get(4)?,
                        task_id: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.conn
            .query_row(
                "SELECT id, project_id, title, status, worktree_id, depends_on FROM tasks WHERE id = ?1",
                params![id],
                |row| {
                    let depends_on: String = row.get(5)?;
                    Ok(TaskRecord {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        title: row.get(2)?,
                        status: row.get(3)?,
                        worktree_id: row.get(4)?,
                        depends_on: depends_on
                            .split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn upsert_worktree(&self, worktree: &WorktreeRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO worktrees (id, project_id, branch, path, status, task_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                task_id = excluded.task_id",
            params![worktree.id, worktree.project_id, worktree.branch, worktree.path, worktree.status, worktree.task_id],
        )?;
        Ok(())
    }

    /// Worktrees with `status = 'active'`, across all projects.
    pub fn list_active_worktrees(&self) -> Result<Vec<WorktreeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, branch, path, status, task_id FROM worktrees WHERE status = 'active'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorktreeRecord {
                id: row.get(0)?,
                project_id: row.get(1)?,
                branch: row.get(2)?,
                path: row.get(3)?,
                status: row.get(4)?,
                task_id: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, task_id, agent_profile_id, role, status, human_attached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                human_attached = excluded.human_attached,
                last_activity_at = datetime('now')",
            params![
                session.id,
                session.task_id,
                session.agent_profile_id,
                session.role,
                session.status,
                session.human_attached as i64
            ],
        )?;
        Ok(())
    }

    /// Sessions bound to a specific task; ad-hoc sessions with `task_id IS
    /// NULL` never show up here.
    pub fn sessions_for_task(&self, task_id: &str) -> Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, agent_profile_id, role, status, human_attached FROM sessions WHERE task_id = ?1",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(SessionRecord {
                id: row.get(0)?,
                task_id: row.get(1)?,
                agent_profile_id: row.get(2)?,
                role: row.get(3)?,
                status: row.get(4)?,
                human_attached: row.get::<_, i64>(5)? != 0,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn append_history(&self, project_id: &str, role: &str, content: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO orchestrator_history (project_id, role, content) VALUES (?1, ?2, ?3)",
            params![project_id, role, content],
        )?;
        Ok(())
    }

    pub fn recent_history(&self, project_id: &str, limit: usize) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT role, content FROM orchestrator_history WHERE project_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AgentermError::from)?;
        out.reverse();
        Ok(out)
    }

    pub fn increment_role_loop_attempt(&self, task_id: &str, role: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO role_loop_attempts (task_id, role, attempts) VALUES (?1, ?2, 1)
             ON CONFLICT(task_id, role) DO UPDATE SET attempts = attempts + 1",
            params![task_id, role],
        )?;
        let attempts: i64 = self.conn.query_row(
            "SELECT attempts FROM role_loop_attempts WHERE task_id = ?1 AND role = ?2",
            params![task_id, role],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn record_review(&self, task_id: &str, iteration: i64, verdict: &str, summary: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO review_records (task_id, iteration, verdict, summary) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, iteration, verdict, summary],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_project_with_default_orchestrator() {
        let mut store = Store::open_in_memory().unwrap();
        let project = ProjectRecord {
            id: "p1".into(),
            name: "demo".into(),
            repo_path: "/tmp/demo".into(),
            status: "active".into(),
            playbook_id: None,
        };
        store.create_project_with_default_orchestrator(&project).unwrap();
        let history = store.recent_history("p1", 10).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_upsert_task_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .create_project_with_default_orchestrator(&ProjectRecord {
                id: "p1".into(),
                name: "demo".into(),
                repo_path: "/tmp/demo".into(),
                status: "active".into(),
                playbook_id: None,
            })
            .unwrap();

        let task = TaskRecord {
            id: "t1".into(),
            project_id: "p1".into(),
            title: "do the thing".into(),
            status: "pending".into(),
            worktree_id: None,
            depends_on: vec![],
        };
        store.upsert_task(&task).unwrap();
        let fetched = store.get_task("t1").unwrap().unwrap();
        assert_eq!(fetched.title, "do the thing");
        assert_eq!(fetched.status, "pending");
    }

    #[test]
    fn test_role_loop_attempt_cap() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.increment_role_loop_attempt("t1", "reviewer").unwrap(), 1);
        assert_eq!(store.increment_role_loop_attempt("t1", "reviewer").unwrap(), 2);
        assert_eq!(store.increment_role_loop_attempt("t1", "reviewer").unwrap(), 3);
    }
}
