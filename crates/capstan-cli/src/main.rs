use capstan_agent::{
    executor_fn, task_event_channel, Action, AgentConfig, ApprovalCallback, QueueProvider,
    TaskEvent, TaskEventKind, TaskEventSink, TaskLoop, TaskResult, ToolDescriptor, ToolOutcome,
    ToolRegistry,
};
use capstan_taskstore::{
    Checkpoint, JsonStateStore, RelatedTask, SearchHit, SqliteStateStore, StateStore, TaskState,
    TaskStatus,
};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "capstan-cli")]
#[command(about = "CLI host for the Capstan task loop")]
struct Cli {
    /// Directory holding persisted task state. Falls back to
    /// CAPSTAN_STATE_DIR, then ./.capstan.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = BackendKind::Json)]
    backend: BackendKind,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Inspect(InspectArgs),
    Checkpoints(CheckpointsArgs),
    Restore(RestoreArgs),
    Related(RelatedArgs),
    Search(SearchArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON file holding an array of provider actions to replay.
    #[arg(long)]
    script: PathBuf,
    #[arg(long)]
    task: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    auto_approve: bool,
    #[arg(long)]
    rate_limit: Option<u32>,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long = "no-auto-checkpoint", action = ArgAction::SetTrue)]
    no_auto_checkpoint: bool,
    #[arg(long)]
    max_checkpoints: Option<usize>,
    /// Ask for tool approvals on the console instead of granting them.
    #[arg(long, action = ArgAction::SetTrue)]
    approve_console: bool,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    #[arg(long)]
    task_id: String,
}

#[derive(clap::Args, Debug)]
struct CheckpointsArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(clap::Args, Debug)]
struct RestoreArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    checkpoint_id: String,
}

#[derive(clap::Args, Debug)]
struct RelatedArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

#[derive(clap::Args, Debug)]
struct SearchArgs {
    #[arg(long)]
    query: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Json,
    Sqlite,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Environment files are optional; absence is not an error.
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let result = match cli.command {
        Commands::Run(args) => run_command(args, &state_dir, cli.backend).await,
        Commands::Inspect(args) => inspect_command(args, &state_dir, cli.backend).await,
        Commands::Checkpoints(args) => checkpoints_command(args, &state_dir, cli.backend).await,
        Commands::Restore(args) => restore_command(args, &state_dir, cli.backend).await,
        Commands::Related(args) => related_command(args, &state_dir, cli.backend).await,
        Commands::Search(args) => search_command(args, &state_dir, cli.backend).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(
    args: RunArgs,
    state_dir: &Path,
    backend: BackendKind,
) -> Result<ExitCode, String> {
    let source = std::fs::read_to_string(&args.script).map_err(|error| {
        format!(
            "failed reading script file '{}': {error}",
            args.script.display()
        )
    })?;
    let actions = parse_actions(&source)?;
    let store = open_store(state_dir, backend, args.max_checkpoints)?;

    let defaults = AgentConfig::default();
    let config = AgentConfig {
        rate_limit: args.rate_limit.unwrap_or(defaults.rate_limit),
        auto_approve_tools: args.auto_approve,
        max_iterations: args.max_iterations.unwrap_or(defaults.max_iterations),
        auto_checkpoint: !args.no_auto_checkpoint,
        ..defaults
    };

    let (event_sink, event_task) = event_stream();
    let task = args
        .task
        .unwrap_or_else(|| format!("replay script {}", args.script.display()));

    let mut task_loop = TaskLoop::new(
        config,
        Arc::new(QueueProvider::new(actions)),
        demo_registry(state_dir),
        store,
    )
    .map_err(|error| error.to_string())?
    .with_event_sink(event_sink);
    if args.approve_console {
        task_loop = task_loop.with_approval_callback(Arc::new(ConsoleApproval));
    }

    let outcome = task_loop.run(task).await;

    // Dropping the loop closes the event channel so the printer drains
    // and exits before the summary or error is reported.
    drop(task_loop);
    event_task.await.map_err(|error| error.to_string())?;

    let result = outcome.map_err(|error| error.to_string())?;
    print_run_summary(&result);
    Ok(exit_code_for_status(result.status))
}

async fn inspect_command(
    args: InspectArgs,
    state_dir: &Path,
    backend: BackendKind,
) -> Result<ExitCode, String> {
    let store = open_store(state_dir, backend, None)?;
    let state = store
        .load(&args.task_id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or_else(|| format!("task not found: {}", args.task_id))?;
    print_state_summary(&state);
    Ok(ExitCode::SUCCESS)
}

async fn checkpoints_command(
    args: CheckpointsArgs,
    state_dir: &Path,
    backend: BackendKind,
) -> Result<ExitCode, String> {
    let store = open_store(state_dir, backend, None)?;
    let checkpoints = store
        .list_checkpoints(&args.task_id, args.limit)
        .await
        .map_err(|error| error.to_string())?;
    if checkpoints.is_empty() {
        println!("no checkpoints for task {}", args.task_id);
        return Ok(ExitCode::SUCCESS);
    }
    for checkpoint in &checkpoints {
        print_checkpoint_line(checkpoint);
    }
    Ok(ExitCode::SUCCESS)
}

async fn restore_command(
    args: RestoreArgs,
    state_dir: &Path,
    backend: BackendKind,
) -> Result<ExitCode, String> {
    let store = open_store(state_dir, backend, None)?;
    let state = store
        .restore_checkpoint(&args.task_id, &args.checkpoint_id)
        .await
        .map_err(|error| error.to_string())?;
    println!(
        "restored task {} from checkpoint {}",
        args.task_id, args.checkpoint_id
    );
    print_state_summary(&state);
    Ok(ExitCode::SUCCESS)
}

async fn related_command(
    args: RelatedArgs,
    state_dir: &Path,
    backend: BackendKind,
) -> Result<ExitCode, String> {
    let store = open_store(state_dir, backend, None)?;
    let related = store
        .related_tasks(&args.task_id, args.limit)
        .await
        .map_err(|error| error.to_string())?;
    if related.is_empty() {
        println!("no related tasks for {}", args.task_id);
        return Ok(ExitCode::SUCCESS);
    }
    for entry in &related {
        print_related_line(entry);
    }
    Ok(ExitCode::SUCCESS)
}

async fn search_command(
    args: SearchArgs,
    state_dir: &Path,
    backend: BackendKind,
) -> Result<ExitCode, String> {
    let store = open_store(state_dir, backend, None)?;
    let hits = store
        .search_history(&args.query, args.limit)
        .await
        .map_err(|error| error.to_string())?;
    if hits.is_empty() {
        println!("no tasks match '{}'", args.query);
        return Ok(ExitCode::SUCCESS);
    }
    for hit in &hits {
        print_search_line(hit);
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var("CAPSTAN_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".capstan")
}

fn open_store(
    state_dir: &Path,
    backend: BackendKind,
    max_checkpoints: Option<usize>,
) -> Result<Arc<dyn StateStore>, String> {
    match backend {
        BackendKind::Json => {
            let store = match max_checkpoints {
                Some(limit) => JsonStateStore::with_max_checkpoints(state_dir, limit),
                None => JsonStateStore::new(state_dir),
            }
            .map_err(|error| error.to_string())?;
            Ok(Arc::new(store))
        }
        BackendKind::Sqlite => {
            let db_path = state_dir.join("capstan.db");
            let store = match max_checkpoints {
                Some(limit) => SqliteStateStore::open_with_max_checkpoints(&db_path, limit),
                None => SqliteStateStore::open(&db_path),
            }
            .map_err(|error| error.to_string())?;
            Ok(Arc::new(store))
        }
    }
}

fn parse_actions(source: &str) -> Result<Vec<Action>, String> {
    let actions: Vec<Action> =
        serde_json::from_str(source).map_err(|error| format!("invalid action script: {error}"))?;
    if actions.is_empty() {
        return Err("action script is empty".to_string());
    }
    Ok(actions)
}

fn demo_registry(state_dir: &Path) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(
        ToolDescriptor {
            name: "echo".to_string(),
            description: "Echoes the text argument back".to_string(),
            parameters: serde_json::json!({"text": "string"}),
        },
        executor_fn(|arguments| async move {
            let text = arguments
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            ToolOutcome::ok(format!("echo: {text}"), serde_json::json!({"echo": text}))
        }),
    );

    let artifacts = state_dir.join("artifacts");
    registry.register(
        ToolDescriptor {
            name: "write_file".to_string(),
            description: "Writes content to a file under the artifact directory".to_string(),
            parameters: serde_json::json!({"path": "string", "content": "string"}),
        },
        executor_fn(move |arguments| {
            let artifacts = artifacts.clone();
            async move { write_file_tool(&artifacts, &arguments) }
        }),
    );
    registry
}

fn write_file_tool(artifacts: &Path, arguments: &Value) -> ToolOutcome {
    let Some(requested) = arguments.get("path").and_then(Value::as_str) else {
        return ToolOutcome::failure("write_file requires a path argument");
    };
    let target = match artifact_path(artifacts, requested) {
        Ok(target) => target,
        Err(message) => return ToolOutcome::failure(message),
    };
    let content = arguments
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let written = target
        .parent()
        .map(std::fs::create_dir_all)
        .unwrap_or(Ok(()))
        .and_then(|_| std::fs::write(&target, content));
    match written {
        Ok(()) => ToolOutcome::ok(
            format!("wrote {}", target.display()),
            serde_json::json!({
                "path": target.display().to_string(),
                "bytes": content.len(),
            }),
        ),
        Err(error) => ToolOutcome::failure(format!("write failed: {error}")),
    }
}

/// Demo tool writes stay under the artifact directory; anything that
/// could point outside it is refused.
fn artifact_path(root: &Path, requested: &str) -> Result<PathBuf, String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err("write_file path must not be empty".to_string());
    }
    let candidate = Path::new(trimmed);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|part| !matches!(part, std::path::Component::Normal(_)))
    {
        return Err(format!(
            "write_file path must stay under the artifact directory: {trimmed}"
        ));
    }
    Ok(root.join(candidate))
}

fn event_stream() -> (TaskEventSink, tokio::task::JoinHandle<()>) {
    let (sink, mut rx) = task_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });
    (sink, task)
}

fn print_event(event: &TaskEvent) {
    let line = match &event.kind {
        TaskEventKind::TaskStarted { description } => format!("task started: {description}"),
        TaskEventKind::IterationStarted { iteration } => format!("iteration {iteration}"),
        TaskEventKind::RateLimited { wait_ms } => format!("rate limited for {wait_ms}ms"),
        TaskEventKind::ActionReceived { action } => format!("action: {action}"),
        TaskEventKind::ApprovalRequested { tool_name } => {
            format!("approval requested: {tool_name}")
        }
        TaskEventKind::ApprovalResolved {
            tool_name,
            granted,
            manual,
        } => format!(
            "approval {}: {tool_name} ({})",
            if *granted { "granted" } else { "denied" },
            if *manual { "manual" } else { "auto" },
        ),
        TaskEventKind::ToolStarted { tool_name } => format!("tool started: {tool_name}"),
        TaskEventKind::ToolFinished { tool_name, outcome } => {
            format!("tool finished: {tool_name} ({outcome})")
        }
        TaskEventKind::CheckpointCreated {
            checkpoint_id,
            sequence_no,
        } => format!("checkpoint {sequence_no} saved ({checkpoint_id})"),
        TaskEventKind::DebugPaused { point } => format!("debug pause at {point}"),
        TaskEventKind::DebugResumed { stepping } => {
            if *stepping {
                "debug step".to_string()
            } else {
                "debug resume".to_string()
            }
        }
        TaskEventKind::TaskFinished { status, failure } => match failure {
            Some(reason) => format!("task finished: {status} ({reason})"),
            None => format!("task finished: {status}"),
        },
    };
    println!("[{}] {line}", event.timestamp);
}

/// Console gate for manual approvals. Any answer other than an
/// explicit yes denies the call.
struct ConsoleApproval;

#[async_trait::async_trait]
impl ApprovalCallback for ConsoleApproval {
    async fn get_approval(&self, tool_name: &str, arguments: &Value, description: &str) -> bool {
        let prompt = format!("[?] task '{description}' wants to run {tool_name} with {arguments}");
        match tokio::task::spawn_blocking(move || ask_console(prompt)).await {
            Ok(granted) => granted,
            Err(_) => false,
        }
    }
}

fn ask_console(prompt: String) -> bool {
    eprintln!("{prompt}");
    let raw = match read_line("approve [y/N]: ") {
        Some(value) => value,
        None => return false,
    };
    let lowered = raw.trim().to_ascii_lowercase();
    lowered == "y" || lowered == "yes"
}

fn read_line(prompt: &str) -> Option<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{prompt}").ok()?;
    stdout.flush().ok()?;

    let mut raw = String::new();
    io::stdin().read_line(&mut raw).ok()?;
    Some(raw.trim().to_string())
}

fn print_run_summary(result: &TaskResult) {
    println!("task_id: {}", result.task_id);
    println!("status: {}", result.status);
    println!("iterations: {}", result.iterations);
    if let Some(answer) = result.result.as_deref() {
        println!("result: {answer}");
    }
    if let Some(reason) = result.failure {
        println!("failure_reason: {reason}");
    }
}

fn print_state_summary(state: &TaskState) {
    println!("task_id: {}", state.task_id);
    println!("description: {}", state.description);
    println!("status: {}", state.status);
    println!("started_at: {}", state.started_at);
    println!(
        "finished_at: {}",
        state.finished_at.as_deref().unwrap_or("<none>")
    );
    println!("messages: {}", state.messages.len());
    println!("tool_executions: {}", state.tool_executions.len());
    println!("user_inputs: {}", state.user_inputs.len());
    if let Some(reason) = state.failure {
        println!("failure_reason: {reason}");
    }
}

fn print_checkpoint_line(checkpoint: &Checkpoint) {
    println!(
        "[seq={}] {} {} {}",
        checkpoint.sequence_no,
        checkpoint.checkpoint_id,
        checkpoint.timestamp,
        checkpoint.description
    );
}

fn print_related_line(entry: &RelatedTask) {
    println!(
        "[sim={:.2}] {} {} ({})",
        entry.similarity,
        entry.task_id,
        entry.description,
        if entry.completed { "completed" } else { "open" }
    );
}

fn print_search_line(hit: &SearchHit) {
    println!("[score={}] {}", hit.score, hit.task_id);
}

fn exit_code_for_status(status: TaskStatus) -> ExitCode {
    match status {
        TaskStatus::Completed => ExitCode::SUCCESS,
        TaskStatus::Suspended => ExitCode::from(3),
        _ => ExitCode::from(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_scripts_parse_into_provider_actions() {
        let script = r#"[
            {"type": "tool_call", "name": "echo", "arguments": {"text": "hi"}},
            {"type": "clarification_request", "question": "which file?"},
            {"type": "complete", "result": "done"}
        ]"#;
        let actions = parse_actions(script).expect("script should parse");
        assert_eq!(actions.len(), 3);
        assert!(matches!(&actions[0], Action::ToolCall { name, .. } if name == "echo"));
        assert!(matches!(&actions[2], Action::Complete { result } if result == "done"));
    }

    #[test]
    fn empty_or_malformed_scripts_are_rejected() {
        assert!(parse_actions("[]").is_err());
        assert!(parse_actions(r#"{"type": "complete", "result": "done"}"#).is_err());
        assert!(parse_actions("not json").is_err());
    }

    #[test]
    fn artifact_paths_cannot_escape_the_artifact_directory() {
        let root = Path::new("/tmp/demo/artifacts");
        assert!(artifact_path(root, "notes/result.txt").is_ok());
        assert!(artifact_path(root, "../escape.txt").is_err());
        assert!(artifact_path(root, "/etc/passwd").is_err());
        assert!(artifact_path(root, "a/../../b").is_err());
        assert!(artifact_path(root, "").is_err());
    }
}
