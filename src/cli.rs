//! CLI argument parsing
//!
//! Uses clap derive macros. One subcommand family per component: task
//! store, pipeline, agent registry, task graph/sync, event log, plus
//! `supervise` to run the Supervisor Loop itself.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(name = "claw-town")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root (default: $CLAW_TOWN_PROJECT_DIR or the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// tmux session name the supervisor's windows live under
    #[arg(long, global = true)]
    pub session: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Task store: create, inspect, and mutate `.tasks/T*.json`
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Pipeline: the fixed role-handoff stage machine over tasks
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Agent registry: per-agent health records under `.claw_town/agents/`
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Run one Sync Engine cycle (reconcile task files against tasks.json)
    Sync,

    /// Loop the Sync Engine on an interval until interrupted
    Watch {
        /// Seconds between sync cycles
        #[arg(long, default_value_t = 30)]
        interval_seconds: u64,
    },

    /// Walk the task dependency graph from a root task
    Dag {
        /// Root T-number to walk from
        root: String,
        /// Walk dependents (what this task unblocks) instead of dependencies
        #[arg(long, default_value_t = false)]
        dependents: bool,
        /// Only direct neighbors, not a full breadth-first walk
        #[arg(long, default_value_t = false)]
        direct_only: bool,
        /// Maximum BFS depth
        #[arg(long, default_value_t = 10)]
        max_depth: u32,
    },

    /// Task graph: `tasks.json`, the cross-project cached view of the backlog
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Event log: append-only JSONL journal of supervisor-visible transitions
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Run the Supervisor Loop until SIGTERM/SIGHUP/SIGINT
    Supervise,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskAction {
    /// Create a new task
    Create {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Fetch a task by T-number
    Get { t_number: String },
    /// Update fields on a task
    Update {
        t_number: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Close a task
    Close { t_number: String },
    /// Reopen a closed task
    Reopen {
        t_number: String,
        #[arg(long)]
        status: Option<String>,
    },
    /// Record that `blocker` blocks `blocked`
    Block { blocker: String, blocked: String },
    /// Append a comment to a task
    Comment {
        t_number: String,
        content: String,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// List a task's comments
    Comments {
        t_number: String,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// List a task's direct dependents
    Dependents { t_number: String },
    /// List a task's direct dependencies
    Dependencies { t_number: String },
    /// Search tasks by tag (OR semantics)
    Search {
        #[arg(value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Assign a task to a user
    Assign { t_number: String, user: String },
    /// List every task in the store
    List,
}

#[derive(Subcommand, Debug)]
pub enum PipelineAction {
    /// Print the fixed stage/role ordering
    Stages,
    /// Unowned tasks sitting at a role's stage
    ListAvailable { role: String },
    /// Claim a task for a role
    Claim { t_number: String, role: String },
    /// Release a task, advancing it to the next stage
    Release { t_number: String },
    /// Reject a task back to an earlier stage
    Reject {
        t_number: String,
        target_stage: String,
        reason: String,
    },
    /// Admin override: set a task's stage directly
    SetStage { t_number: String, stage: String },
    /// All tasks grouped by stage
    Board,
}

#[derive(Subcommand, Debug)]
pub enum AgentAction {
    /// Register a new agent (splits a pane if `--spawn` is given)
    Register {
        name: String,
        window: String,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
    /// Record a heartbeat for an agent
    Heartbeat { name: String },
    /// Record a missed heartbeat for an agent
    MissHeartbeat { name: String },
    /// List registered agents
    List {
        /// Recompute live status against tmux instead of trusting the persisted value
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Live status view for one agent
    Status { name: String },
    /// Tear down an agent (send /exit, SIGTERM, mark dead)
    Kill { name: String },
    /// Kill and re-register an agent under a freshly split pane
    Respawn { name: String, working_dir: String },
    /// Recompute health for every registered agent
    CheckHealth,
    /// Remove an agent's registry record entirely
    Deregister { name: String },
}

#[derive(Subcommand, Debug)]
pub enum GraphAction {
    /// Print the whole cached graph document
    Show,
    /// Initialize a project's graph (idempotent "set if unset")
    Init {
        #[arg(long)]
        root_task: Option<String>,
        #[arg(long)]
        working_dir: Option<String>,
        #[arg(long)]
        gsd_url: Option<String>,
        #[arg(long)]
        gsd_project_id: Option<String>,
    },
    /// Create a task end-to-end: Task Store create + blocking links + graph insert
    Create {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        blocked_by: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        blocking: Vec<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Insert a task into the graph if it isn't already present
    Add {
        t_number: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long)]
        agent_window: Option<String>,
        #[arg(long, default_value = "claw-town")]
        created_by: String,
    },
    /// Update a known task's operational fields (status/name/agent_window)
    Update {
        t_number: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        agent_window: Option<String>,
    },
    /// Update the Sync Engine's cached fields (title/blocked_by)
    SyncCache {
        t_number: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, value_delimiter = ',')]
        blocked_by: Option<Vec<String>>,
    },
    /// Remove a known task from the graph
    Remove { t_number: String },
    /// Known tasks with status == pending
    Pending,
    /// Known tasks with status == working
    Working,
}

#[derive(Subcommand, Debug)]
pub enum EventsAction {
    /// Append one event to events.jsonl
    Log {
        #[arg(long = "type")]
        event_type: String,
        #[arg(long)]
        summary: String,
        #[arg(long)]
        details: Option<String>,
    },
    /// Read events, optionally filtered
    Read {
        #[arg(long)]
        since: Option<String>,
        #[arg(long = "type")]
        event_type: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Most recent event of a given type
    Last {
        #[arg(long = "type")]
        event_type: String,
    },
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    use clap::CommandFactory;
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "claw-town", &mut std::io::stdout());
}
