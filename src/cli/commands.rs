//! CLI command definitions for swe-judge.
//!
//! Three commands: resolve an image reference, evaluate a file of patched
//! instances, and run one command in a fresh sandbox for debugging.

use crate::config::{EnvironmentKind, HarnessConfig};
use crate::eval::{evaluate_batch, EvaluationJob, EvaluationSummary, Evaluator};
use crate::image::resolve_image_name;
use crate::sandbox::EnvironmentFactory;
use crate::task::{load_instances, TaskInstance, DEFAULT_PATCH_FIELD};
use clap::Parser;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default number of concurrent sandboxes.
const DEFAULT_PARALLEL: usize = 4;

/// Sandboxed evaluation of candidate patches against repository tasks.
#[derive(Parser)]
#[command(name = "swe-judge")]
#[command(about = "Evaluate candidate patches against SWE task instances in isolated sandboxes")]
#[command(version)]
#[command(
    long_about = "swe-judge applies candidate patches to SWE-style task instances inside Apptainer or Docker sandboxes and runs each instance's tests.\n\nExample usage:\n  swe-judge evaluate --input predictions.jsonl --config harness.yaml --family swe-smith --parallel 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print the container image reference for an instance.
    Image(ImageArgs),

    /// Evaluate candidate patches against task instances.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Start a sandbox for an instance and run a single command in it.
    Exec(ExecArgs),
}

/// Arguments for `swe-judge image`.
#[derive(Parser, Debug)]
pub struct ImageArgs {
    /// Instance identifier (e.g. `django__django-11099`).
    pub instance_id: String,

    /// Dataset family (swe-bench, swe-gym, swe-smith).
    #[arg(short, long, default_value = "swe-bench")]
    pub family: String,
}

/// Arguments for `swe-judge evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Instance file (.jsonl, .json, .yaml) carrying the candidate patches.
    #[arg(short, long)]
    pub input: String,

    /// Harness configuration file (YAML).
    #[arg(short, long)]
    pub config: Option<String>,

    /// Dataset family for records without their own `data_source`.
    #[arg(short, long)]
    pub family: Option<String>,

    /// Record field holding the candidate patch.
    #[arg(long, default_value = DEFAULT_PATCH_FIELD)]
    pub patch_field: String,

    /// Container runtime, overriding the configuration file.
    #[arg(long)]
    pub runtime: Option<EnvironmentKind>,

    /// Number of concurrent sandboxes.
    #[arg(short, long, default_value_t = DEFAULT_PARALLEL)]
    pub parallel: usize,

    /// Write per-instance results as JSONL to this file.
    #[arg(short, long)]
    pub output: Option<String>,

    /// Print the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `swe-judge exec`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Instance identifier used to resolve the image.
    #[arg(long)]
    pub instance_id: String,

    /// Dataset family (swe-bench, swe-gym, swe-smith).
    #[arg(short, long, default_value = "swe-bench")]
    pub family: String,

    /// Harness configuration file (YAML).
    #[arg(short, long)]
    pub config: Option<String>,

    /// Container runtime, overriding the configuration file.
    #[arg(long)]
    pub runtime: Option<EnvironmentKind>,

    /// Working directory inside the sandbox.
    #[arg(long)]
    pub cwd: Option<String>,

    /// Command timeout in seconds.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Command to run (after `--`).
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Image(args) => run_image_command(args),
        Commands::Evaluate(args) => run_evaluate_command(args).await,
        Commands::Exec(args) => run_exec_command(args).await,
    }
}

fn load_config(path: Option<&str>, runtime: Option<EnvironmentKind>) -> anyhow::Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => HarnessConfig::from_yaml_file(Path::new(path))?,
        None => HarnessConfig::default(),
    };
    if let Some(kind) = runtime {
        config.environment.kind = kind;
    }
    Ok(config)
}

fn run_image_command(args: ImageArgs) -> anyhow::Result<()> {
    let image = resolve_image_name(&args.instance_id, &args.family)?;
    println!("{image}");
    Ok(())
}

/// Builds one job per record, taking the patch from `patch_field`.
fn build_jobs(instances: Vec<TaskInstance>, patch_field: &str, family: Option<&str>) -> Vec<EvaluationJob> {
    instances
        .into_iter()
        .map(|instance| {
            let patch = match instance.field_str(patch_field) {
                Some(patch) => patch.to_string(),
                None => {
                    warn!(instance_id = %instance.instance_id, field = %patch_field, "Record has no patch, evaluating empty patch");
                    String::new()
                }
            };
            let data_source = instance
                .data_source
                .clone()
                .or_else(|| family.map(str::to_string))
                .unwrap_or_default();
            EvaluationJob::new(instance, patch, data_source)
        })
        .collect()
}

async fn run_evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    let input = Path::new(&args.input);
    if !input.exists() {
        return Err(anyhow::anyhow!("Input file does not exist: {}", args.input));
    }

    let config = load_config(args.config.as_deref(), args.runtime)?;
    let instances = load_instances(input)?;
    if instances.is_empty() {
        anyhow::bail!("No instances found in {}", args.input);
    }

    let jobs = build_jobs(instances, &args.patch_field, args.family.as_deref());
    info!(
        "Evaluating {} instances from {} with {} sandbox(es), parallelism={}",
        jobs.len(),
        args.input,
        config.environment.kind,
        args.parallel
    );

    let evaluator = Evaluator::new(config);
    let summary = evaluate_batch(&evaluator, &jobs, args.parallel).await?;

    if let Some(output) = &args.output {
        write_results(Path::new(output), &summary)?;
        info!("Wrote {} results to {}", summary.results.len(), output);
    }

    if args.json {
        let json = serde_json::to_string_pretty(&summary)?;
        println!("{json}");
    } else {
        print_summary(&summary);
    }

    Ok(())
}

fn write_results(path: &Path, summary: &EvaluationSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    for result in &summary.results {
        writeln!(file, "{}", serde_json::to_string(result)?)?;
    }
    Ok(())
}

fn print_summary(summary: &EvaluationSummary) {
    let elapsed = (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0;

    println!("\n=== Evaluation Results ===");
    println!("Total instances:  {}", summary.total);
    println!(
        "Resolved:         {} ({:.1}%)",
        summary.resolved,
        summary.resolve_rate() * 100.0
    );
    println!("Patch failed:     {}", summary.patch_apply_failed);
    println!("Tests failed:     {}", summary.test_failed);
    println!("Timed out:        {}", summary.timed_out);
    println!("Env failures:     {}", summary.env_failed);
    println!("Infra failures:   {}", summary.infrastructure_failed);
    println!("Invalid:          {}", summary.invalid);
    println!("Wall time:        {:.1}s", elapsed);
    println!();

    for r in &summary.results {
        let status = match r.failure {
            Some(kind) => kind.to_string(),
            None => "resolved".to_string(),
        };
        println!(
            "  {} [{}] {:.1}s",
            r.instance_id,
            status,
            r.elapsed_ms as f64 / 1000.0
        );
        if let Some(err) = &r.eval_error {
            let last_line = err.lines().last().unwrap_or_default();
            println!("    error: {last_line}");
        }
    }
}

async fn run_exec_command(args: ExecArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), args.runtime)?;
    let instance = TaskInstance::new(&args.instance_id);
    let command = args.command.join(" ");
    let timeout = args.timeout.map(Duration::from_secs);

    let factory = EnvironmentFactory::new();
    let mut env = factory.create(&config, &instance, &args.family).await?;
    info!(image = %env.image(), "Sandbox started");

    let outcome = env.execute(&command, args.cwd.as_deref(), timeout).await;
    env.cleanup().await;
    let outcome = outcome?;

    print!("{}", outcome.output);
    if outcome.timed_out {
        anyhow::bail!("Command timed out");
    }
    if outcome.return_code != 0 {
        anyhow::bail!("Command exited with code {}", outcome.return_code);
    }
    Ok(())
}
