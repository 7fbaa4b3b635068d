//! claw-town — multi-agent orchestration supervisor for tmux-hosted AI
//! agent sessions.
//!
//! Usage:
//!   claw-town task create "fix the thing"
//!   claw-town pipeline board
//!   claw-town supervise

mod cli;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claw_town::errors::{ClawTownError, Result};
use claw_town::{event_log, paths, pipeline, process_adapter, registry, supervisor, sync, task_graph, task_store};
use cli::{AgentAction, Cli, Commands, EventsAction, GraphAction, PipelineAction, TaskAction};
use process_adapter::TmuxAdapter;

fn resolve_project_dir(cli: &Cli) -> PathBuf {
    cli.project_dir.clone().unwrap_or_else(paths::project_dir)
}

fn default_session(project_dir: &Path) -> String {
    let name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    format!("claw-town-{name}")
}

/// Daily-rotating log directory under the OS cache dir.
fn log_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/claw-town/logs"),
        |dirs| dirs.cache_dir().join("claw-town").join("logs"),
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).map_err(ClawTownError::Json)?);
    Ok(())
}

fn parse_since(raw: Option<String>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|s| {
        chrono::DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&chrono::Utc))
            .map_err(|e| ClawTownError::Validation {
                field: "since",
                value: s,
                allowed: format!("RFC3339 timestamp ({e})"),
            })
    })
    .transpose()
}

#[tokio::main]
async fn main() {
    color_eyre::install().expect("failed to install panic/backtrace hook");
    let cli = Cli::parse();

    let log_dir = log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "claw-town.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let log_filter = format!("claw_town={}", cli.log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(non_blocking))
        .init();

    if let Err(e) = run(cli).await {
        // Exit code 1 with a single-line JSON error object.
        eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = resolve_project_dir(&cli);
    let state_dir = paths::state_dir(&project_dir);
    let tasks_dir = paths::tasks_dir(&project_dir);
    let session = cli.session.clone().unwrap_or_else(|| default_session(&project_dir));

    match cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }

        Commands::Task { action } => run_task(&tasks_dir, action),
        Commands::Pipeline { action } => run_pipeline(&tasks_dir, action),
        Commands::Agent { action } => run_agent(&state_dir, &session, action),
        Commands::Graph { action } => run_graph(&project_dir, &tasks_dir, &state_dir, action),
        Commands::Events { action } => run_events(&state_dir, action),

        Commands::Sync => {
            let changes = sync::sync(&project_dir)?;
            print_json(&changes)
        }
        Commands::Watch { interval_seconds } => {
            tracing::info!(interval_seconds, "watching for task changes");
            sync::watch(&project_dir, std::time::Duration::from_secs(interval_seconds), || false).await
        }
        Commands::Dag { root, dependents, direct_only, max_depth } => {
            let direction = if dependents {
                task_store::WalkDirection::Dependents
            } else {
                task_store::WalkDirection::Dependencies
            };
            let nodes = task_store::walk_dag(&tasks_dir, &root, direction, direct_only, max_depth)?;
            print_json(&nodes)
        }

        Commands::Supervise => {
            tracing::info!(%session, project_dir = %project_dir.display(), "starting supervisor loop");
            let adapter = TmuxAdapter;
            supervisor::run(&project_dir, &session, &adapter).await
        }
    }
}

fn run_task(tasks_dir: &Path, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::Create { title, description, tags, priority } => {
            print_json(&task_store::create(tasks_dir, &title, description.as_deref(), &tags, priority.as_deref())?)
        }
        TaskAction::Get { t_number } => print_json(&task_store::get(tasks_dir, &t_number)?),
        TaskAction::Update { t_number, status, title, description, priority, tags, stage, owner } => {
            let task = task_store::update(
                tasks_dir,
                &t_number,
                task_store::TaskUpdate { status, title, description, priority, tags, stage, owner },
            )?;
            print_json(&task)
        }
        TaskAction::Close { t_number } => print_json(&task_store::close(tasks_dir, &t_number)?),
        TaskAction::Reopen { t_number, status } => {
            print_json(&task_store::reopen(tasks_dir, &t_number, status.as_deref())?)
        }
        TaskAction::Block { blocker, blocked } => {
            task_store::add_blocking(tasks_dir, &blocker, &blocked)?;
            println!("{blocker} now blocks {blocked}");
            Ok(())
        }
        TaskAction::Comment { t_number, content, prefix } => {
            print_json(&task_store::comment(tasks_dir, &t_number, &content, prefix.as_deref())?)
        }
        TaskAction::Comments { t_number, prefix } => {
            print_json(&task_store::comments(tasks_dir, &t_number, prefix.as_deref())?)
        }
        TaskAction::Dependents { t_number } => print_json(&task_store::list_dependents(tasks_dir, &t_number)?),
        TaskAction::Dependencies { t_number } => print_json(&task_store::list_dependencies(tasks_dir, &t_number)?),
        TaskAction::Search { tags } => print_json(&task_store::search(tasks_dir, &tags)?),
        TaskAction::Assign { t_number, user } => print_json(&task_store::assign(tasks_dir, &t_number, &user)?),
        TaskAction::List => print_json(&task_store::list_all(tasks_dir)?),
    }
}

fn run_pipeline(tasks_dir: &Path, action: PipelineAction) -> Result<()> {
    match action {
        PipelineAction::Stages => print_json(&pipeline::stages()),
        PipelineAction::ListAvailable { role } => print_json(&pipeline::list_available(tasks_dir, &role)?),
        PipelineAction::Claim { t_number, role } => print_json(&pipeline::claim(tasks_dir, &t_number, &role)?),
        PipelineAction::Release { t_number } => print_json(&pipeline::release(tasks_dir, &t_number)?),
        PipelineAction::Reject { t_number, target_stage, reason } => {
            print_json(&pipeline::reject(tasks_dir, &t_number, &target_stage, &reason)?)
        }
        PipelineAction::SetStage { t_number, stage } => print_json(&pipeline::set_stage(tasks_dir, &t_number, &stage)?),
        PipelineAction::Board => print_json(&pipeline::board(tasks_dir)?),
    }
}

fn run_agent(state_dir: &Path, session: &str, action: AgentAction) -> Result<()> {
    let adapter = TmuxAdapter;
    match action {
        AgentAction::Register { name, window, task_id, pid, mode, role } => print_json(&registry::register(
            state_dir,
            &name,
            task_id.as_deref(),
            &window,
            pid,
            mode.as_deref(),
            role.as_deref(),
        )?),
        AgentAction::Heartbeat { name } => print_json(&registry::heartbeat(state_dir, &name)?),
        AgentAction::MissHeartbeat { name } => print_json(&registry::miss_heartbeat(state_dir, &name)?),
        AgentAction::List { refresh } => {
            let adapter_ref: Option<&dyn process_adapter::ProcessAdapter> = if refresh { Some(&adapter) } else { None };
            print_json(&registry::list(state_dir, adapter_ref)?)
        }
        AgentAction::Status { name } => print_json(&registry::status(state_dir, &name, &adapter)?),
        AgentAction::Kill { name } => {
            registry::kill(state_dir, &name, &adapter)?;
            println!("killed {name}");
            Ok(())
        }
        AgentAction::Respawn { name, working_dir } => {
            print_json(&registry::respawn(state_dir, &name, &adapter, session, &working_dir)?)
        }
        AgentAction::CheckHealth => print_json(&registry::check_health(state_dir, &adapter)?),
        AgentAction::Deregister { name } => {
            registry::deregister(state_dir, &name)?;
            println!("deregistered {name}");
            Ok(())
        }
    }
}

fn project_name(project_dir: &Path) -> String {
    project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn run_graph(project_dir: &Path, tasks_dir: &Path, state_dir: &Path, action: GraphAction) -> Result<()> {
    match action {
        GraphAction::Show => print_json(&task_graph::load(state_dir)?),
        GraphAction::Init { root_task, working_dir, gsd_url, gsd_project_id } => {
            let project = project_name(project_dir);
            task_graph::initialize(state_dir, &project, root_task.as_deref(), working_dir.as_deref())?;
            if gsd_url.is_some() || gsd_project_id.is_some() {
                task_graph::set_gsd_config(state_dir, gsd_url.as_deref(), gsd_project_id.as_deref())?;
            }
            print_json(&task_graph::load(state_dir)?)
        }
        GraphAction::Create { title, description, blocked_by, blocking, name, tags, status } => {
            let project = project_name(project_dir);
            print_json(&task_graph::create_task_full(
                tasks_dir,
                state_dir,
                &project,
                &title,
                description.as_deref(),
                &blocked_by,
                &blocking,
                name.as_deref(),
                &tags,
                &status,
            )?)
        }
        GraphAction::Add { t_number, title, status, agent_window, created_by } => {
            task_graph::add_task(state_dir, &t_number, title.as_deref(), &status, agent_window.as_deref(), &created_by)?;
            print_json(&task_graph::load(state_dir)?)
        }
        GraphAction::Update { t_number, status, name, agent_window } => {
            let found = task_graph::update_agent(state_dir, &t_number, status.as_deref(), name.as_deref(), agent_window.as_deref())?;
            if !found {
                return Err(ClawTownError::TaskNotFound(t_number));
            }
            print_json(&task_graph::load(state_dir)?)
        }
        GraphAction::SyncCache { t_number, title, status, blocked_by } => {
            let found = task_graph::update_cached_fields(state_dir, &t_number, title.as_deref(), status.as_deref(), blocked_by.as_deref())?;
            if !found {
                return Err(ClawTownError::TaskNotFound(t_number));
            }
            print_json(&task_graph::load(state_dir)?)
        }
        GraphAction::Remove { t_number } => {
            let removed = task_graph::remove_task(state_dir, &t_number)?;
            println!("{{\"removed\": {removed}}}");
            Ok(())
        }
        GraphAction::Pending => {
            let graph = task_graph::load(state_dir)?;
            let pending: Vec<_> = graph.known_tasks.iter().filter(|(_, t)| t.status == "pending").collect();
            print_json(&pending)
        }
        GraphAction::Working => {
            let graph = task_graph::load(state_dir)?;
            let working: Vec<_> = graph.known_tasks.iter().filter(|(_, t)| t.status == "working").collect();
            print_json(&working)
        }
    }
}

fn run_events(state_dir: &Path, action: EventsAction) -> Result<()> {
    match action {
        EventsAction::Log { event_type, summary, details } => {
            let parsed = event_log::EventType::parse(&event_type).ok_or_else(|| ClawTownError::Validation {
                field: "type",
                value: event_type.clone(),
                allowed: "nudge_orch, nudge_agent, agent_stall, learn, task_sync, task_complete, restart_orch, restart_agent".to_string(),
            })?;
            event_log::log_event(state_dir, parsed, &summary, details.as_deref())?;
            Ok(())
        }
        EventsAction::Read { since, event_type, limit } => {
            let since = parse_since(since)?;
            print_json(&event_log::read_events(state_dir, since, event_type.as_deref(), limit)?)
        }
        EventsAction::Last { event_type } => print_json(&event_log::last_event_of_type(state_dir, &event_type)?),
    }
}
