//! CLI binary for compiling, validating and running PAI pipelines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pai_api::{HttpRunApi, ListRunsRequest, PipelineRunApi};
use pai_pipeline::{
    ManifestContext, PipelineDefinition, PipelineRun, RunEvent, Severity, SubmitOptions,
    WaitOptions,
};
use pai_types::{PaiError, RunStatus, SessionConfig};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pai", version, about = "Compile, submit and follow PAI pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Session config file (default: $PAI_CONFIG_PATH or ~/.pai/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Region of the pipeline service, e.g. cn-hangzhou
    #[arg(long, global = true)]
    region: Option<String>,

    /// Workspace to create and list runs in
    #[arg(long, global = true)]
    workspace: Option<String>,

    /// Full service endpoint, overriding the one derived from the region
    #[arg(long, global = true)]
    endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a pipeline definition to its manifest
    Compile {
        /// Path to the definition (.yaml or .json)
        definition: PathBuf,

        /// Also emit the manifests of the container components it uses
        #[arg(long)]
        components: bool,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a pipeline definition
    Validate {
        /// Path to the definition (.yaml or .json)
        definition: PathBuf,
    },

    /// Submit and manage pipeline runs
    #[command(subcommand)]
    Run(RunCommands),
}

#[derive(Subcommand)]
enum RunCommands {
    /// Submit a pipeline definition as a new run
    Submit {
        definition: PathBuf,

        /// Run name (default: the pipeline name)
        #[arg(short, long)]
        name: Option<String>,

        /// Pipeline argument as NAME=VALUE; VALUE is parsed as JSON when it can be
        #[arg(short = 'a', long = "arg", value_parser = parse_argument)]
        arguments: Vec<(String, serde_json::Value)>,

        /// Wait for the run to finish
        #[arg(short, long)]
        wait: bool,

        /// Don't tail node logs while waiting
        #[arg(long)]
        no_logs: bool,
    },

    /// Show a run and the status of its nodes
    Status { run_id: String },

    /// Wait for a run to finish, tailing node logs
    Wait {
        run_id: String,

        /// Don't tail node logs
        #[arg(long)]
        no_logs: bool,

        /// Seconds between status polls
        #[arg(long, default_value = "2")]
        interval: u64,
    },

    /// Start a run that was created without confirmation
    Start { run_id: String },

    /// Terminate a run
    Terminate { run_id: String },

    /// List runs
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<RunStatus>,

        /// Only runs with this name
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "20")]
        page_size: u32,
    },

    /// List the outputs of a run
    Outputs {
        run_id: String,

        /// Only outputs with this name
        #[arg(long)]
        name: Option<String>,

        /// Only outputs of this type, e.g. Model or DataSet
        #[arg(long = "type")]
        output_type: Option<String>,
    },
}

fn parse_argument(s: &str) -> Result<(String, serde_json::Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("argument name is empty in '{s}'"));
    }
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config = session_config(&cli)?;

    match cli.command {
        Commands::Compile {
            definition,
            components,
            output,
        } => {
            cmd_compile(&config, &definition, components, output.as_deref())?;
        }
        Commands::Validate { definition } => {
            cmd_validate(&definition)?;
        }
        Commands::Run(command) => {
            cmd_run(&config, command).await?;
        }
    }

    Ok(())
}

/// Config file, then `PAI_*` environment, then flags.
fn session_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let flags = SessionConfig {
        region_id: cli.region.clone(),
        workspace_id: cli.workspace.clone(),
        endpoint: cli.endpoint.clone(),
        ..Default::default()
    };
    Ok(SessionConfig::resolve(cli.config.as_deref())?.merge(flags))
}

fn connect(config: &SessionConfig) -> anyhow::Result<Arc<dyn PipelineRunApi>> {
    let api = HttpRunApi::from_config(config)?;
    tracing::debug!(endpoint = %api.base_url(), "Connected to pipeline service");
    Ok(Arc::new(api))
}

fn cmd_compile(
    config: &SessionConfig,
    path: &Path,
    components: bool,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let pipeline = PipelineDefinition::load(path)?.into_pipeline()?;
    let ctx = ManifestContext::from_config(config);

    let mut documents = Vec::new();
    if components {
        for manifest in pipeline.component_manifests(&ctx)? {
            documents.push(serde_yaml::to_string(&manifest)?);
        }
    }
    documents.push(pipeline.to_manifest(&ctx)?);
    let rendered = documents.join("---\n");

    match output {
        Some(out) => {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(out, rendered)?;
            println!("Wrote {}", out.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let builder = PipelineDefinition::load(path)?.into_builder()?;
    let diagnostics = builder.lint()?;

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        if diag.severity == Severity::Error {
            has_error = true;
        }
        println!("[{}] {}: {}", diag.severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_run(config: &SessionConfig, command: RunCommands) -> anyhow::Result<()> {
    let api = connect(config)?;
    match command {
        RunCommands::Submit {
            definition,
            name,
            arguments,
            wait,
            no_logs,
        } => {
            let pipeline = PipelineDefinition::load(&definition)?.into_pipeline()?;
            let options = SubmitOptions {
                job_name: name,
                arguments: arguments.into_iter().collect::<BTreeMap<_, _>>(),
                workspace_id: config.workspace_id.clone(),
            };
            let run = pipeline
                .submit(api, &ManifestContext::from_config(config), options)
                .await?;
            println!("Submitted run {} ({})", run.run_id(), run.name());
            if wait {
                wait_for(run, !no_logs, WaitOptions::default()).await?;
            }
        }
        RunCommands::Status { run_id } => {
            let run = PipelineRun::get(api, &run_id).await?;
            print_run(&run);
            if let Some(root) = run.info().root_node_id() {
                let nodes = run
                    .travel_node_status_info(root, WaitOptions::default().max_depth)
                    .await?;
                for (path, node) in &nodes {
                    println!("  {:<40} {}", path, node.status);
                }
            }
        }
        RunCommands::Wait {
            run_id,
            no_logs,
            interval,
        } => {
            let run = PipelineRun::get(api, &run_id).await?;
            let options = WaitOptions {
                poll_interval: std::time::Duration::from_secs(interval.max(1)),
                ..Default::default()
            };
            wait_for(run, !no_logs, options).await?;
        }
        RunCommands::Start { run_id } => {
            PipelineRun::get(api, &run_id).await?.start().await?;
            println!("Started run {run_id}");
        }
        RunCommands::Terminate { run_id } => {
            PipelineRun::get(api, &run_id).await?.terminate().await?;
            println!("Terminated run {run_id}");
        }
        RunCommands::List {
            status,
            name,
            page_size,
        } => {
            let request = ListRunsRequest {
                status,
                name,
                workspace_id: config.workspace_id.clone(),
                page_size,
                ..Default::default()
            };
            let runs = PipelineRun::list(api, &request).await?;
            if runs.is_empty() {
                println!("No runs");
            }
            for run in &runs {
                print_run(run);
            }
        }
        RunCommands::Outputs {
            run_id,
            name,
            output_type,
        } => {
            let run = PipelineRun::get(api, &run_id).await?;
            let outputs = run.outputs(name.as_deref(), output_type.as_deref()).await?;
            if outputs.is_empty() {
                println!("No outputs");
            }
            for output in &outputs {
                println!(
                    "{} [{}] {}",
                    output.name,
                    output.output_type.as_deref().unwrap_or("-"),
                    output
                        .value
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!("{:<24} {:<32} {}", run.run_id(), run.name(), run.status());
}

/// Wait with Ctrl-C wired to cancellation; node status changes are printed
/// as they are observed.
async fn wait_for(
    mut run: PipelineRun,
    show_logs: bool,
    options: WaitOptions,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let done = CancellationToken::new();
    let printer = spawn_event_printer(run.events().subscribe(), done.clone(), |line| {
        println!("{line}")
    });

    let options = WaitOptions { show_logs, ..options };
    let result = run.wait_for_completion(options, cancel).await;
    done.cancel();
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Event printer failed");
    }

    match result {
        Ok(status) => {
            println!("Run {} finished: {status}", run.run_id());
            Ok(())
        }
        Err(PaiError::Cancelled { run_id }) => {
            println!("Stopped waiting for run {run_id}; it keeps running remotely");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn describe_event(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::NodeDiscovered { path, status, .. } => Some(format!("{path}: {status}")),
        RunEvent::NodeStatusChanged { path, from, to } => Some(format!("{path}: {from} -> {to}")),
        RunEvent::NodeLog { .. } | RunEvent::RunSucceeded { .. } | RunEvent::RunFailed { .. } => None,
    }
}

/// Print run events until `done` fires. Events already queued when it fires
/// are still printed.
fn spawn_event_printer<F>(
    mut events: broadcast::Receiver<RunEvent>,
    done: CancellationToken,
    mut print: F,
) -> JoinHandle<()>
where
    F: FnMut(String) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                _ = done.cancelled() => break,
            };
            match event {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        print(line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Fell behind on run events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pai_pipeline::EventEmitter;
    use std::sync::Mutex;

    #[test]
    fn parse_argument_reads_json_or_falls_back_to_string() {
        assert_eq!(parse_argument("epochs=3").unwrap(), ("epochs".into(), serde_json::json!(3)));
        assert_eq!(
            parse_argument("data=oss://bucket/x").unwrap(),
            ("data".into(), serde_json::json!("oss://bucket/x"))
        );
        assert!(parse_argument("novalue").is_err());
        assert!(parse_argument("=1").is_err());
    }

    #[tokio::test]
    async fn printer_flushes_events_queued_before_the_wait_ends() {
        let events = EventEmitter::new(16);
        let done = CancellationToken::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let printer = spawn_event_printer(events.subscribe(), done.clone(), move |line| {
            sink.lock().unwrap().push(line)
        });

        events.emit(RunEvent::NodeDiscovered {
            path: "job.train".into(),
            node_id: "n1".into(),
            status: RunStatus::Running,
        });
        events.emit(RunEvent::NodeStatusChanged {
            path: "job.train".into(),
            from: RunStatus::Running,
            to: RunStatus::Succeeded,
        });
        events.emit(RunEvent::RunSucceeded { run_id: "flow-1".into() });
        done.cancel();
        printer.await.unwrap();

        assert_eq!(
            *lines.lock().unwrap(),
            vec!["job.train: Running", "job.train: Running -> Succeeded"]
        );
    }
}
