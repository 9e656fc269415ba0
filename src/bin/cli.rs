use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use run_engine::prelude::*;
use run_engine::task::InputType;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "run-engine")]
#[command(about = "Submit automation tasks and follow their runs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to an engine config YAML file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and follow the run until it ends
    Submit {
        #[command(flatten)]
        task: TaskArgs,

        /// Execute through the configured delegate executor
        #[arg(short, long)]
        delegate: bool,

        /// Target endpoint passed to the delegate
        #[arg(short, long, requires = "delegate")]
        target: Option<String>,

        /// Override the config's time scale (0 runs instantly)
        #[arg(long)]
        time_scale: Option<f64>,

        /// Print each transition as a JSON stream event
        #[arg(long)]
        json: bool,
    },

    /// Print the step plan a task would run
    Plan {
        #[command(flatten)]
        task: TaskArgs,
    },

    /// List the built-in templates
    Templates,

    /// Check that the delegate executor is reachable
    Health,
}

#[derive(Args)]
struct TaskArgs {
    /// Template id or name (e.g., stock-transfer)
    #[arg(short = 'T', long, conflicts_with = "custom")]
    template: Option<String>,

    /// Template input as KEY=VALUE (repeatable)
    #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    inputs: Vec<(String, String)>,

    /// Free-text task description
    #[arg(long)]
    custom: Option<String>,

    /// Owner recorded on the run
    #[arg(short, long, default_value = "cli")]
    owner: String,
}

impl TaskArgs {
    fn descriptor(&self) -> anyhow::Result<TaskDescriptor> {
        let inputs: HashMap<String, String> = self.inputs.iter().cloned().collect();
        match (&self.template, &self.custom) {
            (Some(template), _) => Ok(TaskDescriptor::template(&self.owner, template, inputs)),
            (None, Some(text)) => Ok(TaskDescriptor::custom(&self.owner, text)),
            (None, None) => anyhow::bail!("Either --template or --custom is required"),
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((key.trim().to_string(), value.to_string()))
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let filter = if verbose {
        "run_engine=debug"
    } else {
        "run_engine=info"
    };

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
        .expect("Failed to create OTLP exporter");

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("run-engine");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
}

#[cfg(not(feature = "otel"))]
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "run_engine=debug"
    } else {
        "run_engine=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Submit {
            task,
            delegate,
            target,
            time_scale,
            json,
        } => {
            let mut config = config;
            if let Some(scale) = time_scale {
                config.time_scale = scale;
            }
            submit(config, task.descriptor()?, delegate, target, json).await
        }
        Commands::Plan { task } => print_plan(config, task.descriptor()?),
        Commands::Templates => list_templates(config),
        Commands::Health => health(config).await,
    }
}

async fn submit(
    config: EngineConfig,
    task: TaskDescriptor,
    delegate: bool,
    target: Option<String>,
    json: bool,
) -> anyhow::Result<bool> {
    let service = RunService::new(config)?;

    // attach before submitting so the queued transition is printed too
    let events = service.event_stream();
    let run_id = if delegate {
        service.submit_delegated(task, target).await?
    } else {
        service.submit(task).await?
    };
    println!("Submitted run {}", run_id);

    let printer = async {
        while let Some(event) = events.recv().await {
            print_event(&event, &run_id, json);
        }
    };

    let run = tokio::select! {
        run = service.wait(&run_id) => run?,
        _ = printer => service.wait(&run_id).await?,
        _ = tokio::signal::ctrl_c(), if delegate => {
            println!("Cancelling run {}...", run_id);
            service.cancel(&run_id).await?;
            service.wait(&run_id).await?
        }
    };

    // events published before the terminal snapshot was observed
    while let Some(event) = events.try_recv() {
        print_event(&event, &run_id, json);
    }

    print_run_result(&run);
    Ok(run.status == RunStatus::Completed)
}

fn print_event(event: &StreamEvent, run_id: &str, json: bool) {
    if event.task_id.as_deref() != Some(run_id) {
        return;
    }
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode event: {}", e),
        }
    } else if let Some(result) = &event.result {
        println!(
            "[{:>3}%] {:<9} {}",
            result.progress, result.status, result.current_step
        );
    }
}

fn print_plan(config: EngineConfig, task: TaskDescriptor) -> anyhow::Result<bool> {
    let service = RunService::new(config)?;
    let plan = service.plan(&task);

    println!("Plan ({} steps):\n", plan.len());
    for (i, step) in plan.iter().enumerate() {
        let mut notes = Vec::new();
        if step.can_fail {
            notes.push(format!("may fail: {}", step.failure_message()));
        }
        if step.takes_screenshot {
            notes.push("screenshot".to_string());
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", notes.join(", "))
        };
        println!(
            "  {:>2}. {} ({} ms){}",
            i + 1,
            step.description,
            step.duration.as_millis(),
            notes
        );
    }
    Ok(true)
}

fn list_templates(config: EngineConfig) -> anyhow::Result<bool> {
    let service = RunService::new(config)?;

    println!("Templates:\n");
    for template in service.templates().list() {
        println!("  {} - {}", template.id, template.name);
        println!("    {}", template.description);
        for input in &template.inputs {
            let kind = match &input.input_type {
                InputType::Text => "text".to_string(),
                InputType::Number => "number".to_string(),
                InputType::Select { options } => format!("one of {}", options.join("/")),
            };
            let required = if input.required { "" } else { ", optional" };
            println!("    --input {}=<{}{}>  {}", input.id, kind, required, input.label);
        }
        println!();
    }
    Ok(true)
}

async fn health(config: EngineConfig) -> anyhow::Result<bool> {
    if config.delegate.is_none() {
        anyhow::bail!("No delegate configured; pass --config with a `delegate` section");
    }
    let service = RunService::new(config)?;

    match service.health().await {
        Ok(()) => {
            println!("✓ Delegate executor is healthy");
            Ok(true)
        }
        Err(e) => {
            println!("✗ Delegate executor unavailable: {}", e);
            Ok(false)
        }
    }
}

fn print_run_result(run: &Run) {
    println!("\n=== Run Result ===\n");
    println!("Run ID: {}", run.id);
    println!("Status: {}", run.status);
    println!("Progress: {}%", run.progress);
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }
    if let Some(end) = run.end_time {
        let elapsed = end - run.start_time;
        println!("Duration: {} ms", elapsed.num_milliseconds());
    }

    println!("\nLog:");
    for entry in &run.logs {
        println!("  {:>2}. {}", entry.step_number, entry.message);
    }
    if !run.screenshots.is_empty() {
        println!("\nScreenshots:");
        for shot in &run.screenshots {
            println!("  {}", shot);
        }
    }
}
