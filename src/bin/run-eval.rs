use std::{fs::File, io::Write, path::PathBuf, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskwerk::{
    load_tasks, CompletionRetryPolicy, Environment, EvalError, InMemoryConversationStore, OpenAI,
    ScriptedEnvironment, TaskRunner, TurnDriver,
};

/// Runs a batch of benchmark tasks against an OpenAI-compatible model
/// and reports rewards, action diffs, and cost totals.
#[derive(Debug, Parser)]
#[command(name = "run-eval")]
struct Args {
    /// Task file (YAML/JSON) or directory of task files.
    #[arg(long)]
    tasks: PathBuf,

    /// Model identifier sent to the completion endpoint.
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Sampling temperature; endpoint default when unset.
    #[arg(long)]
    temperature: Option<f32>,

    /// Upper bound on concurrently running tasks.
    #[arg(long, default_value_t = 4)]
    max_concurrency: usize,

    /// Number of trials per task.
    #[arg(long, default_value_t = 1)]
    num_trials: usize,

    /// Comma-separated task indices to run; all tasks when unset.
    #[arg(long, value_delimiter = ',')]
    task_ids: Option<Vec<usize>>,

    /// Turn budget for tasks without an explicit one.
    #[arg(long, default_value_t = 30)]
    default_max_turns: usize,

    /// Completion retry attempts per turn.
    #[arg(long, default_value_t = 3)]
    max_retry_attempts: usize,

    /// Tool name treated as state-mutating; repeatable.
    #[arg(long = "mutating-tool")]
    mutating_tools: Vec<String>,

    /// Tool name withheld from the agent entirely; repeatable.
    #[arg(long = "blacklist")]
    blacklisted_tools: Vec<String>,

    /// Write one JSON result per line to this file.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), EvalError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let tasks = load_tasks(&args.tasks)?;

    let provider = Arc::new(OpenAI::from_env()?);
    let store = InMemoryConversationStore::shared();

    let mut driver = TurnDriver::new(provider, args.model.as_str())
        .with_default_max_turns(args.default_max_turns)
        .with_retry_policy(CompletionRetryPolicy::new().with_max_attempts(args.max_retry_attempts))
        .with_mutating_tools(args.mutating_tools.clone())
        .with_blacklisted_tools(args.blacklisted_tools.clone())
        .with_store(store);
    if let Some(temperature) = args.temperature {
        driver = driver.with_temperature(temperature);
    }

    let mut runner = TaskRunner::new(Arc::new(driver))
        .with_max_concurrency(args.max_concurrency)
        .with_num_trials(args.num_trials);
    if let Some(task_ids) = args.task_ids.clone() {
        runner = runner.with_task_indices(task_ids);
    }

    let env_tasks = tasks.clone();
    let report = runner
        .run(tasks, move |_| {
            Box::new(ScriptedEnvironment::new(env_tasks.clone())) as Box<dyn Environment>
        })
        .await?;

    if let Some(path) = &args.out {
        let mut file = File::create(path)?;
        for outcome in &report.results {
            let line = serde_json::to_string(outcome)?;
            writeln!(file, "{line}")?;
        }
    }

    println!(
        "completed {}/{} runs, {} successful ({:.1}%)",
        report.completed,
        report.total,
        report.successful,
        report.success_rate() * 100.0
    );
    println!(
        "total reward {:.2}, agent cost ${:.4}, user-sim cost ${:.4}",
        report.total_reward, report.total_cost, report.total_user_cost
    );

    Ok(())
}
