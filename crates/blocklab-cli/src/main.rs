use anyhow::{anyhow, Context, Result};
use blocklab_core::CommandBatch;
use blocklab_gen::{run_generation, GenerationDefaults, ProcessBackend};
use blocklab_runner::{evaluate_run, invoke_worker, resolve_spec, run_record};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "blocklab",
    version = "0.1.0",
    about = "Smoke-test harness for world-mutating agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot worker against a live server and verify its report.
    Smoke {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        step_delay_ms: Option<u64>,
        /// Worker runtime executable.
        #[arg(long)]
        runner: Option<String>,
        /// Worker entrypoint script.
        #[arg(long)]
        script: Option<PathBuf>,
        /// Command plan: a `generate` reply (or plain command lines), `-` for stdin.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Append a JSONL fact row for this run under DIR/facts/.
        #[arg(long)]
        record_dir: Option<PathBuf>,
    },
    /// Turn a build instruction into a command plan via the inference backend.
    Generate {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        top_p: Option<f64>,
        #[arg(long)]
        max_new_tokens: Option<u32>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        hf_token: Option<String>,
        /// Inference backend executable.
        #[arg(long)]
        backend: Option<String>,
        /// Inference backend entrypoint script.
        #[arg(long)]
        backend_script: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Smoke {
            host,
            port,
            username,
            version,
            timeout_ms,
            step_delay_ms,
            runner,
            script,
            plan,
            record_dir,
        } => run_smoke(SmokeArgs {
            host,
            port,
            username,
            version,
            timeout_ms,
            step_delay_ms,
            runner,
            script,
            plan,
            record_dir,
        }),
        Commands::Generate {
            model,
            temperature,
            top_p,
            max_new_tokens,
            device,
            hf_token,
            backend,
            backend_script,
        } => run_generate(GenerateArgs {
            model,
            temperature,
            top_p,
            max_new_tokens,
            device,
            hf_token,
            backend,
            backend_script,
        }),
    };
    std::process::exit(code);
}

struct SmokeArgs {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    version: Option<String>,
    timeout_ms: Option<u64>,
    step_delay_ms: Option<u64>,
    runner: Option<String>,
    script: Option<PathBuf>,
    plan: Option<PathBuf>,
    record_dir: Option<PathBuf>,
}

fn run_smoke(args: SmokeArgs) -> i32 {
    let spec = match resolve_spec(blocklab_runner::SpecOverrides {
        host: args.host,
        port: args.port,
        username: args.username,
        version: args.version,
        timeout_ms: args.timeout_ms,
        step_delay_ms: args.step_delay_ms,
    }) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("ERROR: {:#}", err);
            return 1;
        }
    };

    let mut locator = blocklab_runner::WorkerLocator::default();
    if let Some(program) = args.runner {
        locator.program = program;
    }
    if let Some(script) = args.script {
        locator.script = script;
    }

    let batch = match args.plan.as_deref().map(load_plan).transpose() {
        Ok(batch) => batch,
        Err(err) => {
            eprintln!("ERROR: {:#}", err);
            return 1;
        }
    };

    let raw = match invoke_worker(&locator, &spec, batch.as_ref()) {
        Ok(raw) => raw,
        Err(err @ blocklab_runner::LaunchError::Unavailable { .. }) => {
            eprintln!("ERROR: {}. Install the worker runtime first.", err);
            return blocklab_runner::RUNNER_UNAVAILABLE_EXIT_CODE;
        }
        Err(err) => {
            eprintln!("ERROR: {}", err);
            return 1;
        }
    };

    let mut stderr = std::io::stderr();
    let evaluation = match evaluate_run(&raw, &locator.install_dir(), &mut stderr) {
        Ok(evaluation) => evaluation,
        Err(err) => {
            eprintln!("ERROR: {:#}", err);
            return 1;
        }
    };

    if let Some(record_dir) = args.record_dir {
        let row = run_record(&spec, batch.as_ref(), &raw, &evaluation);
        if let Err(err) = append_record(&record_dir, &row) {
            eprintln!("WARN: failed to record run: {:#}", err);
        }
    }

    if evaluation.verdict.success {
        let origin = evaluation
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.origin.clone());
        match origin {
            Some(origin) => println!(
                "OK: worker executed commands and verified blocks. origin={}",
                origin
            ),
            None => println!("OK: worker executed commands and verified blocks."),
        }
    }

    evaluation.verdict.exit_code
}

fn append_record(record_dir: &std::path::Path, row: &blocklab_runner::RunRecord) -> Result<()> {
    use blocklab_runner::RunSink;
    let mut sink = blocklab_runner::JsonlRunSink::new(record_dir)?;
    sink.append_run_record(row)?;
    sink.flush()
}

fn load_plan(path: &std::path::Path) -> Result<CommandBatch> {
    let content = if path == std::path::Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read plan from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?
    };
    plan_batch(&content)
}

/// A plan file is either a `generate` reply object or plain command lines.
fn plan_batch(content: &str) -> Result<CommandBatch> {
    match serde_json::from_str::<Value>(content.trim()) {
        Ok(Value::Object(fields)) => fields
            .get("text")
            .and_then(Value::as_str)
            .map(CommandBatch::from_text)
            .ok_or_else(|| anyhow!("plan object has no text field")),
        _ => Ok(CommandBatch::from_text(content)),
    }
}

struct GenerateArgs {
    model: Option<String>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_new_tokens: Option<u32>,
    device: Option<String>,
    hf_token: Option<String>,
    backend: Option<String>,
    backend_script: Option<PathBuf>,
}

fn run_generate(args: GenerateArgs) -> i32 {
    let mut input = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("ERROR: failed to read request from stdin: {}", err);
        return 1;
    }

    let base = GenerationDefaults::default();
    let defaults = GenerationDefaults {
        model: args.model.unwrap_or(base.model),
        temperature: args.temperature.unwrap_or(base.temperature),
        top_p: args.top_p.unwrap_or(base.top_p),
        max_new_tokens: args.max_new_tokens.unwrap_or(base.max_new_tokens),
        device: args.device.unwrap_or(base.device),
        hf_token: args.hf_token,
    };

    let mut backend = ProcessBackend::default();
    if let Some(program) = args.backend {
        backend.program = program;
    }
    if let Some(script) = args.backend_script {
        backend.script = script;
    }

    match run_generation(&input, &defaults, &backend, &mut std::io::stderr()) {
        Ok(reply) => match serde_json::to_string(&reply) {
            Ok(line) => {
                println!("{}", line);
                0
            }
            Err(err) => {
                eprintln!("ERROR: failed to encode reply: {}", err);
                1
            }
        },
        Err(err) => {
            eprintln!("ERROR: {}", err);
            err.exit_code()
        }
    }
}
