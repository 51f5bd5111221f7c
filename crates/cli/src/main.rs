#![forbid(unsafe_code)]

use std::path::PathBuf;
use tp_core::ids::WorkspaceId;
use tp_core::time::ts_ms_to_rfc3339;
use tp_engine::{Engine, EngineOptions, JobFilter, install_signal_handlers};
use tp_store::{MirrorMode, Store, StoreMode, StoreOptions};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
taskpilot - job and task orchestration for agent-driven workflows

USAGE:
    taskpilot [OPTIONS] <COMMAND>

COMMANDS:
    status            Show store mode and record counts
    jobs list         List jobs
    jobs show <ID>    Show one job (including its checkpoints)
    runs list         List command runs
    log <JOB_ID>      Print a job's stream log verbatim

OPTIONS:
    --storage-dir <DIR>   Storage root (default: $TASKPILOT_HOME or ./.taskpilot)
    --workspace <ID>      Workspace id (default: $TASKPILOT_WORKSPACE or 'default')
    --require-durable     Fail fast if the relational mirror cannot open
    --no-mirror           Run file-only, skip the relational mirror
    --version             Print version
    --help                Print this help
";

struct CliArgs {
    storage_dir: PathBuf,
    workspace: String,
    mirror: MirrorMode,
    command: Vec<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("taskpilot: {err}");
            1
        }
    };
    std::process::exit(code);
}

fn parse_args(args: Vec<String>) -> Result<Option<CliArgs>, String> {
    let mut storage_dir = std::env::var("TASKPILOT_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".taskpilot"));
    let mut workspace =
        std::env::var("TASKPILOT_WORKSPACE").unwrap_or_else(|_| "default".to_string());
    let mut mirror = MirrorMode::Auto;
    let mut command = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print!("{USAGE}");
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("taskpilot {VERSION}");
                return Ok(None);
            }
            "--storage-dir" => {
                let value = iter.next().ok_or("--storage-dir needs a value")?;
                storage_dir = PathBuf::from(value);
            }
            "--workspace" => {
                workspace = iter.next().ok_or("--workspace needs a value")?;
            }
            "--require-durable" => mirror = MirrorMode::Required,
            "--no-mirror" => mirror = MirrorMode::Disabled,
            other if other.starts_with("--") => {
                return Err(format!("unknown flag: {other}"));
            }
            _ => command.push(arg),
        }
    }

    Ok(Some(CliArgs {
        storage_dir,
        workspace,
        mirror,
        command,
    }))
}

fn run(args: Vec<String>) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(args) = parse_args(args)? else {
        return Ok(0);
    };
    if args.command.is_empty() {
        eprint!("{USAGE}");
        return Ok(2);
    }

    let workspace_id = WorkspaceId::try_new(args.workspace)?;
    let store = Store::open(
        &args.storage_dir,
        StoreOptions {
            mirror: args.mirror,
        },
    )?;
    let engine = Engine::new(store, workspace_id, EngineOptions::default());
    install_signal_handlers(&engine);

    let command: Vec<&str> = args.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["status"] => cmd_status(&engine),
        ["jobs"] | ["jobs", "list"] => cmd_jobs_list(&engine),
        ["jobs", "show", job_id] => cmd_job_show(&engine, job_id),
        ["runs"] | ["runs", "list"] => cmd_runs_list(&engine),
        ["log", job_id] => cmd_log(&engine, job_id),
        other => {
            eprintln!("taskpilot: unknown command: {}", other.join(" "));
            eprint!("{USAGE}");
            Ok(2)
        }
    }
}

fn cmd_status(engine: &Engine) -> Result<i32, Box<dyn std::error::Error>> {
    let mode = match engine.store_mode() {
        StoreMode::Full => "full (file + relational mirror)",
        StoreMode::Degraded => "degraded (file-only)",
    };
    let jobs = engine.list_jobs(&JobFilter::default())?;
    let runs = engine.list_command_runs()?;
    println!("workspace:     {}", engine.workspace_id());
    println!("store mode:    {mode}");
    println!("jobs:          {}", jobs.len());
    println!("command runs:  {}", runs.len());
    Ok(0)
}

fn cmd_jobs_list(engine: &Engine) -> Result<i32, Box<dyn std::error::Error>> {
    let jobs = engine.list_jobs(&JobFilter::default())?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(0);
    }
    for job in jobs {
        let progress = match (job.total_items, job.processed_items) {
            (Some(total), Some(done)) => format!(" {done}/{total}"),
            (Some(total), None) => format!(" 0/{total}"),
            _ => String::new(),
        };
        println!(
            "{}  {:<9}  {}{}  {}",
            job.id,
            job.state,
            job.job_type,
            progress,
            ts_ms_to_rfc3339(job.updated_at_ms),
        );
    }
    Ok(0)
}

fn cmd_job_show(engine: &Engine, job_id: &str) -> Result<i32, Box<dyn std::error::Error>> {
    let Some(job) = engine.get_job(job_id)? else {
        eprintln!("taskpilot: no such job: {job_id}");
        return Ok(1);
    };
    println!("{}", serde_json::to_string_pretty(&job)?);
    let checkpoints = engine.list_checkpoints(job_id)?;
    if !checkpoints.is_empty() {
        println!("checkpoints:");
        for checkpoint in checkpoints {
            println!(
                "  #{:<4} {:<24} {}",
                checkpoint.checkpoint_seq,
                checkpoint.stage,
                ts_ms_to_rfc3339(checkpoint.timestamp_ms),
            );
        }
    }
    Ok(0)
}

fn cmd_runs_list(engine: &Engine) -> Result<i32, Box<dyn std::error::Error>> {
    let runs = engine.list_command_runs()?;
    if runs.is_empty() {
        println!("no command runs");
        return Ok(0);
    }
    for run in runs {
        println!(
            "{}  {:<9}  {}  {}",
            run.id,
            run.status,
            run.command_name,
            ts_ms_to_rfc3339(run.started_at_ms),
        );
    }
    Ok(0)
}

fn cmd_log(engine: &Engine, job_id: &str) -> Result<i32, Box<dyn std::error::Error>> {
    print!("{}", engine.read_job_log(job_id)?);
    Ok(0)
}
