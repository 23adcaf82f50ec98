// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::if_not_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::needless_pass_by_value)]

//! agenterm - local control plane for a fleet of PTY-backed coding agents
//!
//! A single daemon binary that owns terminal sessions, parses their output,
//! fans it out to websocket viewers, runs the automation loops (auto-commit,
//! review coordination, merge), and drives an LLM-backed orchestrator that
//! can act on the fleet through a bounded tool surface. `agentermctl` is the
//! companion thin CLI client; everything else talks to this daemon over its
//! websocket wire contract.

mod cli;
mod config;
mod errors;
mod git;
mod hub;
mod lifecycle;
mod loops;
mod orchestrator;
mod parser;
mod playbook;
mod store;
mod telemetry;
mod terminal;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands, TerminalBackendKind};
use color_eyre::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use config::AgentermConfig;
use hub::wire::OutboundMessage;
use hub::{EventHub, HubCallbacks};
use lifecycle::LifecycleManager;
use loops::ProjectLocks;
use orchestrator::prompt::Lane;
use orchestrator::{HttpLlmClient, LlmClient, OrchestratorKernel, TurnRequest};
use playbook::PlaybookEngine;
use store::{SessionRecord, Store};
use terminal::TerminalBackend;
use tools::{
    file_tools::{ReadFileTool, WriteFileTool},
    git_tools::{GetWorktreeGitLogTool, GetWorktreeGitStatusTool},
    project_tools::{CreateProjectTool, GetProjectTool},
    session_tools::{CreateSessionTool, IsSessionIdleTool, ReadSessionOutputTool, SendCommandTool},
    task_tools::{GenerateProgressReportTool, UpdateTaskStatusTool, WriteTaskSpecTool},
    worktree_tools::{AbandonWorktreeTool, CreateWorktreeTool},
    ToolRegistry,
};

fn get_log_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/agenterm/logs"),
        |dirs| dirs.cache_dir().join("agenterm").join("logs"),
    )
}

fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("agenterm").join("agenterm.conf"))
}

fn build_tool_registry(
    store: Arc<Mutex<Store>>,
    lifecycle: Arc<LifecycleManager>,
    hub: Arc<EventHub>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CreateProjectTool { store: store.clone() }));
    registry.register(Box::new(GetProjectTool { store: store.clone() }));
    registry.register(Box::new(WriteTaskSpecTool { store: store.clone() }));
    registry.register(Box::new(UpdateTaskStatusTool { store: store.clone() }));
    registry.register(Box::new(GenerateProgressReportTool { store: store.clone() }));
    registry.register(Box::new(SendCommandTool { lifecycle: lifecycle.clone() }));
    registry.register(Box::new(ReadSessionOutputTool { lifecycle: lifecycle.clone() }));
    registry.register(Box::new(IsSessionIdleTool { lifecycle: lifecycle.clone() }));
    registry.register(Box::new(GetWorktreeGitStatusTool));
    registry.register(Box::new(GetWorktreeGitLogTool));
    registry.register(Box::new(CreateWorktreeTool { store: store.clone() }));
    registry.register(Box::new(AbandonWorktreeTool { store: store.clone() }));
    registry.register(Box::new(ReadFileTool));
    registry.register(Box::new(WriteFileTool));
    registry.register(Box::new(CreateSessionTool { lifecycle, hub }));
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        cli::print_completions(shell.clone());
        return Ok(());
    }

    color_eyre::install()?;

    let log_dir = get_log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agenterm.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let log_filter = format!("agenterm={}", cli.log_level);
    let otel_layer = match &cli.otel_endpoint {
        Some(endpoint) => {
            let telemetry_config = telemetry::TelemetryConfig::with_endpoint(endpoint.clone());
            match telemetry::otel_layer(&telemetry_config) {
                Ok(layer) => Some(layer),
                Err(e) => {
                    eprintln!("failed to initialize OTEL layer: {e}");
                    None
                }
            }
        }
        None => None,
    };
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(&log_filter))
            .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(non_blocking))
            .with(otel_layer)
            .init();
    }

    let config = AgentermConfig::load(&cli, config_file_path().as_deref())?;

    if cli.print_token {
        println!("{}", config.token);
        return Ok(());
    }

    std::fs::create_dir_all(&config.agents_dir)?;
    std::fs::create_dir_all(&config.playbooks_dir)?;

    let known_tools = [
        "create_project",
        "get_project",
        "write_task_spec",
        "update_task_status",
        "generate_progress_report",
        "send_command",
        "read_session_output",
        "is_session_idle",
        "get_worktree_git_status",
        "get_worktree_git_log",
        "create_worktree",
        "abandon_worktree",
        "read_file",
        "write_file",
        "create_session",
    ];
    let playbooks = Arc::new(PlaybookEngine::load(&config.agents_dir, &config.playbooks_dir, &known_tools)?);

    if matches!(cli.command, Some(Commands::Validate)) {
        tracing::info!("playbooks and agent profiles validated ok");
        return Ok(());
    }

    tracing::info!("starting agenterm v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(port = config.port, db_path = ?config.db_path, "effective configuration loaded");

    let store = Arc::new(Mutex::new(Store::open(&config.db_path)?));

    let backend: Arc<dyn TerminalBackend> = match cli.backend {
        TerminalBackendKind::Pty => Arc::new(terminal::pty::PtyBackend::new()),
        TerminalBackendKind::Tmux => Arc::new(terminal::tmux_backend::TmuxBackend::new()),
    };

    let lifecycle = Arc::new(LifecycleManager::new(backend, store.clone()));

    let cancel = CancellationToken::new();

    // `EventHub` doesn't exist yet when `HubCallbacks` is built, but
    // `on_new_session` needs to broadcast through it once a new session's
    // output starts flowing. This cell is filled immediately after the hub
    // is constructed below, and is always populated by the time a viewer
    // can have connected to send `new_session`.
    let hub_cell: Arc<std::sync::OnceLock<Arc<EventHub>>> = Arc::new(std::sync::OnceLock::new());

    let hub_lifecycle = lifecycle.clone();
    let hub_input_lifecycle = hub_lifecycle.clone();
    let hub_resize_lifecycle = hub_lifecycle.clone();
    let new_session_lifecycle = hub_lifecycle.clone();
    let new_session_hub_cell = hub_cell.clone();
    let callbacks = HubCallbacks {
        on_input: Some(Box::new(move |session_id, keys| {
            let lifecycle = hub_input_lifecycle.clone();
            let session_id = session_id.to_string();
            let keys = keys.to_string();
            tokio::spawn(async move {
                if let Err(e) = lifecycle.send_command(&session_id, &keys).await {
                    tracing::warn!(session_id, error = %e, "failed to forward viewer input");
                }
            });
        })),
        on_resize: Some(Box::new(move |_session_id, _cols, _rows| {
            let _ = &hub_resize_lifecycle;
            // Resize is handled at the PTY backend layer directly; the hub
            // callback exists so a future backend swap has a single seam.
        })),
        on_attach: None,
        on_detach: None,
        // A viewer-initiated `new_session`: a plain shell in the daemon's
        // own working directory, with a human attached from the start.
        // Distinct from the `create_session` tool, which the orchestrator
        // uses to launch an agent into a task's worktree with a full
        // command and environment; the wire message carries neither.
        on_new_session: Some(Box::new(move |name| {
            let id = uuid::Uuid::new_v4().to_string();
            let lifecycle = new_session_lifecycle.clone();
            let hub_cell = new_session_hub_cell.clone();
            let session_id = id.clone();
            let session_name = name.unwrap_or_else(|| "session".to_string());
            tokio::spawn(async move {
                let Some(hub) = hub_cell.get().cloned() else {
                    tracing::warn!(session_id, "new_session requested before event hub was ready");
                    return;
                };
                let session = SessionRecord {
                    id: session_id.clone(),
                    task_id: None,
                    agent_profile_id: "adhoc".to_string(),
                    role: "human".to_string(),
                    status: "working".to_string(),
                    human_attached: true,
                };
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                if let Err(e) = lifecycle
                    .create_and_pump(&session, &["/bin/sh".to_string()], &cwd, &[], hub)
                    .await
                {
                    tracing::warn!(session_id, session_name, error = %e, "failed to create ad-hoc session");
                }
            });
            id
        })),
    };
    let hub = Arc::new(EventHub::new(callbacks));
    let _ = hub_cell.set(hub.clone());

    let hub_run = hub.clone();
    let hub_cancel = cancel.clone();
    let hub_addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let hub_handle = tokio::spawn(async move {
        if let Err(e) = hub_run.run(hub_addr, hub_cancel).await {
            tracing::error!(error = %e, "event hub exited");
        }
    });

    let locks = Arc::new(ProjectLocks::default());

    // A synchronous snapshot of active worktrees, refreshed independently of
    // the auto-commit loop's own tick so its `Fn() -> Vec<_>` closure never
    // needs to await the async store lock.
    let worktree_cache: Arc<std::sync::Mutex<Vec<loops::auto_commit::WatchedWorktree>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));

    let refresh_store = store.clone();
    let refresh_cache = worktree_cache.clone();
    let refresh_cancel = cancel.clone();
    let refresh_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = refresh_cancel.cancelled() => return,
                _ = interval.tick() => {
                    let worktrees = refresh_store.lock().await.list_active_worktrees().unwrap_or_default();
                    let watched: Vec<_> = worktrees
                        .into_iter()
                        .map(|w| loops::auto_commit::WatchedWorktree {
                            project_id: w.project_id,
                            task_id: w.task_id.unwrap_or_default(),
                            path: PathBuf::from(w.path),
                        })
                        .collect();
                    *refresh_cache.lock().unwrap() = watched;
                }
            }
        }
    });

    let ready_commits = loops::coordinator::ReadyCommits::new();

    let auto_commit_cache = worktree_cache.clone();
    let auto_commit_cancel = cancel.clone();
    let auto_commit_ready = ready_commits.clone();
    let auto_commit_handle = tokio::spawn(async move {
        loops::auto_commit::run(
            move || auto_commit_cache.lock().unwrap().clone(),
            |_task_id| false,
            move |project_id, task_id, hash| {
                tracing::info!(project_id, task_id, hash, "checkpoint ready for review");
                auto_commit_ready.mark_ready(task_id, hash);
            },
            auto_commit_cancel,
        )
        .await;
    });

    // Review pairs and merge candidates are recomputed from store state by
    // `state_refresh_handle` below; tasks in `review` status with a bound
    // coder+reviewer session become review pairs, tasks `completed` with a
    // still-active worktree become merge candidates.
    let review_pairs: Arc<std::sync::Mutex<Vec<loops::coordinator::ReviewPair>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let merge_candidates: Arc<std::sync::Mutex<Vec<loops::merge_controller::MergeCandidate>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    // Project ids with a task-status transition observed since the last
    // scanner drain; the orchestrator's event scanner drains this each tick.
    let transitions_pending: Arc<std::sync::Mutex<std::collections::HashSet<String>>> =
        Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));

    let state_refresh_store = store.clone();
    let state_refresh_review = review_pairs.clone();
    let state_refresh_merge = merge_candidates.clone();
    let state_refresh_transitions = transitions_pending.clone();
    let state_refresh_cancel = cancel.clone();
    let state_refresh_handle = tokio::spawn(async move {
        let mut last_status: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = state_refresh_cancel.cancelled() => return,
                _ = interval.tick() => {
                    let store = state_refresh_store.lock().await;
                    let Ok(projects) = store.list_projects() else { continue };
                    let mut reviews = Vec::new();
                    let mut merges = Vec::new();

                    for project in &projects {
                        let Ok(tasks) = store.list_tasks(&project.id) else { continue };
                        for task in &tasks {
                            let previous = last_status.insert(task.id.clone(), task.status.clone());
                            if previous.as_deref() != Some(task.status.as_str()) {
                                state_refresh_transitions.lock().unwrap().insert(project.id.clone());
                            }

                            let Some(worktree_id) = task.worktree_id.as_deref() else { continue };
                            let Ok(Some(worktree)) = store.get_worktree(worktree_id) else { continue };
                            let Ok(sessions) = store.sessions_for_task(&task.id) else { continue };

                            if task.status == "review" {
                                let coder = sessions.iter().find(|s| s.role == "coder");
                                let reviewer = sessions.iter().find(|s| s.role == "reviewer");
                                if let (Some(coder), Some(reviewer)) = (coder, reviewer) {
                                    reviews.push(loops::coordinator::ReviewPair {
                                        project_id: project.id.clone(),
                                        task_id: task.id.clone(),
                                        repo_path: PathBuf::from(&worktree.path),
                                        task_spec: task.title.clone(),
                                        coder_session_id: coder.id.clone(),
                                        reviewer_session_id: reviewer.id.clone(),
                                    });
                                }
                            }

                            if task.status == "completed" && worktree.status == "active" {
                                let coder_session_id = sessions.iter().find(|s| s.role == "coder").map(|s| s.id.clone());
                                let human_attached = sessions.iter().any(|s| s.human_attached);
                                merges.push(loops::merge_controller::MergeCandidate {
                                    project_id: project.id.clone(),
                                    task_id: task.id.clone(),
                                    worktree_id: worktree.id.clone(),
                                    repo_path: PathBuf::from(&worktree.path),
                                    branch: worktree.branch.clone(),
                                    coder_session_id,
                                    human_attached,
                                });
                            }
                        }
                    }
                    drop(store);
                    *state_refresh_review.lock().unwrap() = reviews;
                    *state_refresh_merge.lock().unwrap() = merges;
                }
            }
        }
    });

    let coordinator_lifecycle = lifecycle.clone();
    let coordinator_store = store.clone();
    let coordinator_pairs = review_pairs.clone();
    let coordinator_ready = ready_commits.clone();
    let coordinator_cancel = cancel.clone();
    let coordinator_handle = tokio::spawn(async move {
        loops::coordinator::run(
            coordinator_lifecycle,
            coordinator_store,
            move || coordinator_pairs.lock().unwrap().clone(),
            |_task_id| false,
            coordinator_ready,
            |project_id, task_id, approved| {
                tracing::info!(project_id, task_id, approved, "coordinator review cycle finished");
            },
            coordinator_cancel,
        )
        .await;
    });

    let merge_notified = Arc::new(tokio::sync::Mutex::new(std::collections::HashSet::new()));

    let merge_locks = locks.clone();
    let merge_lifecycle = lifecycle.clone();
    let merge_store = store.clone();
    let merge_candidates_cache = merge_candidates.clone();
    let merge_hub = hub.clone();
    let merge_cancel = cancel.clone();
    let merge_handle = tokio::spawn(async move {
        loops::merge_controller::run(
            &merge_locks,
            &merge_lifecycle,
            &merge_store,
            move || merge_candidates_cache.lock().unwrap().clone(),
            &merge_notified,
            |project_id, task_id| {
                tracing::info!(project_id, task_id, "merge completed");
            },
            move |project_id, task_id, files| {
                tracing::warn!(project_id, task_id, ?files, "merge conflict");
                let hub = merge_hub.clone();
                let project_id = project_id.to_string();
                let task_id = task_id.to_string();
                let files = files.to_vec();
                tokio::spawn(async move {
                    hub.broadcast(
                        None,
                        OutboundMessage::ProjectEvent {
                            project_id,
                            kind: "worktree_merge_conflict".to_string(),
                            detail: serde_json::json!({"task_id": task_id, "files": files}),
                        },
                    )
                    .await;
                });
            },
            merge_cancel,
        )
        .await;
    });

    let llm_client: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(
        config.llm_base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        config.llm_api_key.clone().unwrap_or_default(),
        config.llm_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
    ));
    let tools = Arc::new(build_tool_registry(store.clone(), lifecycle.clone(), hub.clone()));
    let kernel = Arc::new(OrchestratorKernel::new(
        llm_client,
        store.clone(),
        tools,
        playbooks,
        config.orchestrator_global_max_parallel,
    ));

    // `poll_transitions` drains the project ids `state_refresh_handle` marked
    // dirty; `on_trigger` spawns a real orchestrator turn for each, with
    // `plan_approved: true` since these are system-driven automation turns
    // rather than a human-initiated one.
    let scanner_transitions = transitions_pending.clone();
    let poll_transitions = move || scanner_transitions.lock().unwrap().drain().collect::<Vec<_>>();

    let trigger_kernel = kernel.clone();
    let trigger_store = store.clone();
    let on_trigger = move |project_id: &str| {
        let kernel = trigger_kernel.clone();
        let store = trigger_store.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            let playbook_id = store.lock().await.get_project(&project_id).ok().flatten().and_then(|p| p.playbook_id);
            let request = TurnRequest {
                run_id: uuid::Uuid::new_v4().to_string(),
                lane: Lane::Execution,
                project_id: project_id.clone(),
                task_id: None,
                playbook_id,
                stage: None,
                plan_approved: true,
                user_message: "A tracked task or session changed status. Review project state and continue the plan.".to_string(),
            };
            if let Err(e) = kernel
                .run_turn(request, |event| tracing::debug!(?event, "orchestrator event"))
                .await
            {
                tracing::warn!(project_id, error = %e, "orchestrator turn failed");
            }
        });
    };

    let scanner_cancel = cancel.clone();
    let scanner_kernel = kernel.clone();
    let scanner_handle = tokio::spawn(async move {
        scanner_kernel.run_event_scanner(poll_transitions, on_trigger, scanner_cancel).await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    hub_handle.abort();
    refresh_handle.abort();
    state_refresh_handle.abort();
    auto_commit_handle.abort();
    coordinator_handle.abort();
    merge_handle.abort();
    scanner_handle.abort();

    if cli.otel_endpoint.is_some() {
        telemetry::shutdown();
    }

    Ok(())
}
