use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deblur_core::{now_unix, TaskId, TaskReport};
use deblur_runner::{BatchOutcome, BatchRequest, Deblur};

#[derive(Parser)]
#[command(name = "deblur", version)]
struct Cli {
    /// Working root holding .deblur/ (config and task database)
    #[arg(long, env = "DEBLUR_ROOT", global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .deblur/ with the default config and an empty task database
    Init,

    /// Process every image in a folder (reuses an identical earlier task)
    Run {
        input: PathBuf,
        /// Defaults to `<output_root>/<input name><suffix>` from the config
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Use this task id instead of a generated one
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Continue an orphaned or failed task, skipping finished images
    Resume { task_id: String },

    /// Orphan tasks with stale heartbeats and resume the oldest one
    Recover,

    /// List recent tasks
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Progress report for one task
    Show {
        task_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Stop a task at the next image boundary
    Cancel { task_id: String },
}

fn print_outcome(outcome: &BatchOutcome) {
    match outcome {
        BatchOutcome::Reused(t) => {
            println!("Reused task {} ({}): results already in {}", t.id, t.status, t.output_path)
        }
        BatchOutcome::InFlight(t) => println!("Task {} is already {}; not starting another", t.id, t.status),
        BatchOutcome::Finished(s) => {
            println!(
                "Task {} {}: {} completed, {} failed, {} skipped -> {}",
                s.task.id, s.task.status, s.completed, s.failed, s.skipped, s.task.output_path
            );
            if let Some(f) = &s.task.failure {
                println!("  [{}] {}", f.code, f.message);
            }
        }
        BatchOutcome::Canceled(s) => {
            println!("Task {} canceled after {} completed image(s)", s.task.id, s.completed)
        }
    }
}

/// Runs the batch; on Ctrl-C the task is canceled instead of left RUNNING.
async fn run_until_interrupted(app: &Deblur, req: BatchRequest, id: &TaskId) -> anyhow::Result<()> {
    tokio::select! {
        outcome = app.runner.run_batch(req) => {
            print_outcome(&outcome?);
        }
        _ = signal::ctrl_c() => {
            info!(task = %id, "interrupt received");
            match app.store.cancel(id) {
                Ok(task) => println!("Interrupted; task {} canceled", task.id),
                Err(e) => warn!(task = %id, error = %e, "could not cancel interrupted task"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    match cli.cmd {
        Command::Init => {
            let cfg_path = Deblur::init(&root)?;
            println!("Initialized deblur in {} (config: {})", root.display(), cfg_path.display());
        }
        Command::Run {
            input,
            output,
            prompt,
            model,
            task_id,
        } => {
            let app = Deblur::open(root)?;
            let orphaned = app.scanner.mark_stale(now_unix())?;
            if !orphaned.is_empty() {
                info!(count = orphaned.len(), "orphaned stale tasks; run `deblur recover` to resume them");
            }

            let input = std::fs::canonicalize(&input).with_context(|| format!("input folder {}", input.display()))?;
            let output = output.unwrap_or_else(|| app.cfg.default_output_for(&input));
            let mut options = app.cfg.edit_options();
            if let Some(p) = prompt {
                options.prompt = p;
            }
            if let Some(m) = model {
                options.model = m;
            }
            let mut req = BatchRequest::new(input, output, options);
            let id = task_id.map(TaskId::from_str).unwrap_or_default();
            req.task_id = Some(id.clone());

            run_until_interrupted(&app, req, &id).await?;
        }
        Command::Resume { task_id } => {
            let app = Deblur::open(root)?;
            let task = app.store.require_task(&TaskId::from_str(task_id))?;
            run_until_interrupted(&app, BatchRequest::resume_task(&task)?, &task.id).await?;
        }
        Command::Recover => {
            let app = Deblur::open(root)?;
            let report = app.scanner.recover(&app.runner).await?;
            println!("Orphaned: {}", report.orphaned.len());
            match &report.outcome {
                Some(outcome) => print_outcome(outcome),
                None => println!("Nothing to resume"),
            }
            if !report.queued.is_empty() {
                println!("Still queued: {}", report.queued.len());
            }
        }
        Command::Status { limit } => {
            let app = Deblur::open(root)?;
            let tasks = app.store.list_tasks(limit)?;
            println!("Tasks: {}", tasks.len());
            for t in tasks {
                println!(
                    "- {} [{}] {}/{} {}",
                    t.id, t.status, t.processed_files, t.total_files, t.input_path
                );
            }
        }
        Command::Show { task_id, json } => {
            let app = Deblur::open(root)?;
            let id = TaskId::from_str(task_id);
            let task = app
                .store
                .get_task(&id)?
                .ok_or_else(|| anyhow!("no such task: {id}"))?;
            let items = app.store.list_items(&id)?;
            let report = TaskReport::build(&task, &items);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{} [{}] {}% {}", report.task_id, report.status, report.progress_percent, report.summary);
                for e in &report.errors {
                    println!("  {e}");
                }
            }
        }
        Command::Cancel { task_id } => {
            let app = Deblur::open(root)?;
            let task = app.store.cancel(&TaskId::from_str(task_id))?;
            println!("Canceled task {}", task.id);
        }
    }

    Ok(())
}
