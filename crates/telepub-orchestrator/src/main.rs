// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telepub CLI
//!
//! Runs the published nodes orchestrator with in-process workers, validates
//! published nodes files and calls configuration methods.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (./publishednodes.json, log transport)
//! telepub
//!
//! # Using configuration file, two workers
//! telepub --config telepub.toml --workers 2
//!
//! # Write messages to a file
//! telepub --published-nodes pn.json --output-file messages.bin
//!
//! # Validate a published nodes file
//! telepub validate pn.json
//!
//! # Call a configuration method against the file
//! telepub call PublishNodes --payload '{"EndpointUrl":"opc.tcp://plc:4840","OpcNodes":[{"Id":"i=2258"}]}'
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telepub::{
    EngineContext, FileTransport, LogTransport, SimulatedSubscriptionClient, Transport, Worker,
    WorkerConfig, WriterGroupController,
};
use telepub_orchestrator::{
    invoke, parse_entries, JobConverter, Method, OrchestratorConfig, PublishedNodesEntry,
    PublishedNodesReconciler, PublishedNodesWatcher, SchemaValidator, TransportConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Industrial telemetry publisher
#[derive(Parser, Debug)]
#[command(name = "telepub")]
#[command(about = "Telepub - publishes data source changes configured in a published nodes file")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Published nodes file (overrides the configuration file)
    #[arg(short, long)]
    published_nodes: Option<PathBuf>,

    /// JSON schema for the published nodes file
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Worker heartbeat interval (seconds)
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Append encoded messages to this file instead of logging them
    #[arg(short, long)]
    output_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator and workers (default)
    Run,

    /// Validate a published nodes file and show the resulting jobs
    Validate {
        /// Published nodes file
        file: PathBuf,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "telepub.toml")]
        output: PathBuf,
    },

    /// Call a configuration method against the published nodes file
    Call {
        /// Method name (PublishNodes, UnpublishNodes, UnpublishAllNodes,
        /// AddOrUpdateEndpoints, GetConfiguredEndpoints,
        /// GetConfiguredNodesOnEndpoint, GetDiagnosticInfo)
        method: String,

        /// JSON request
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// File holding the JSON request
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = build_config(&args)?;

    match args.command {
        None | Some(Commands::Run) => cmd_run(config).await,
        Some(Commands::Validate { file }) => cmd_validate(&file, &config),
        Some(Commands::GenConfig { output }) => cmd_gen_config(output),
        Some(Commands::Call {
            method,
            payload,
            payload_file,
        }) => {
            let payload = match payload_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => payload,
            };
            cmd_call(&config, &method, payload.as_deref())
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    if let Some(path) = &args.published_nodes {
        config.published_nodes_path = path.clone();
    }
    if let Some(path) = &args.schema {
        config.schema_path = Some(path.clone());
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(secs) = args.heartbeat_interval {
        config.heartbeat_interval_secs = secs;
    }
    if let Some(path) = &args.output_file {
        config.transport = TransportConfig::File { path: path.clone() };
    }
    config.log_level = args.log_level.clone();

    config.validate()?;
    Ok(config)
}

async fn cmd_run(config: OrchestratorConfig) -> anyhow::Result<()> {
    ensure_published_nodes(&config.published_nodes_path)?;

    let reconciler = Arc::new(PublishedNodesReconciler::from_config(&config));
    let outcome = {
        let reconciler = reconciler.clone();
        tokio::task::spawn_blocking(move || reconciler.refresh_from_file()).await?
    };
    tracing::info!(
        file = %config.published_nodes_path.display(),
        ?outcome,
        jobs = reconciler.job_count(),
        "Published nodes loaded"
    );

    let mut watcher = PublishedNodesWatcher::new(reconciler.clone(), config.poll_interval());
    watcher.start().map_err(anyhow::Error::msg)?;

    let transport: Arc<dyn Transport> = match &config.transport {
        TransportConfig::Log => Arc::new(LogTransport),
        TransportConfig::File { path } => Arc::new(
            FileTransport::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
    };
    let context = EngineContext::new(
        Arc::new(SimulatedSubscriptionClient::new()),
        transport,
        config.engine.clone(),
    );

    println!("Telepub v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Published nodes: {}", config.published_nodes_path.display());
    println!("Publisher:       {}", config.engine.publisher_id);
    println!("Workers:         {}", config.worker_count);
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let cancel = CancellationToken::new();
    let mut controllers = Vec::with_capacity(config.worker_count);
    let mut workers = Vec::with_capacity(config.worker_count);
    for i in 0..config.worker_count {
        let controller = Arc::new(WriterGroupController::start(context.clone()));
        let worker_config = WorkerConfig::new(format!("{}-worker-{}", config.engine.publisher_id, i))
            .heartbeat_interval(config.heartbeat_interval());
        let worker = Worker::new(worker_config, reconciler.clone(), controller.clone(), cancel.clone());
        workers.push(tokio::spawn(worker.run()));
        controllers.push(controller);
    }

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("Worker task failed: {}", e);
        }
    }
    for controller in controllers {
        controller.shutdown().await;
    }
    watcher.stop();
    Ok(())
}

/// Create an empty published nodes file so the watcher has something to poll.
fn ensure_published_nodes(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        tracing::info!(file = %path.display(), "Published nodes file not found, creating an empty one");
        std::fs::write(path, "[]").with_context(|| format!("creating {}", path.display()))?;
    }
    Ok(())
}

fn cmd_validate(file: &Path, config: &OrchestratorConfig) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let validator = match &config.schema_path {
        Some(path) => SchemaValidator::from_file(path)?,
        None => SchemaValidator::published_nodes()?,
    };

    let result = validator
        .validate_str(&content)
        .map_err(anyhow::Error::from)
        .and_then(|()| Ok(parse_entries(&content)?));
    let entries: Vec<PublishedNodesEntry> = match result {
        Ok(entries) => entries.into_iter().filter(|e| e.has_nodes()).collect(),
        Err(e) => {
            eprintln!("Published nodes invalid: {}", e);
            std::process::exit(1);
        }
    };

    let jobs = match JobConverter::new(config.engine.clone()).convert(&entries) {
        Ok(jobs) => jobs,
        Err(e) => {
            eprintln!("Published nodes invalid: {}", e);
            std::process::exit(1);
        }
    };

    println!("Published nodes valid!");
    println!();
    println!("Entries: {}", entries.len());
    println!("Jobs:    {}", jobs.len());
    for job in &jobs {
        let group = &job.writer_group;
        println!("  [{}] {}", group.writer_group_id, job.id);
        for writer in &group.writers {
            println!(
                "      {} ({} ms): {} nodes",
                writer.writer_id,
                writer.publishing_interval_ms,
                writer.items.len()
            );
        }
    }
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let config = OrchestratorConfig {
        schema_path: Some(PathBuf::from("publishednodes.schema.json")),
        transport: TransportConfig::File {
            path: PathBuf::from("messages.bin"),
        },
        ..Default::default()
    };

    let toml_str = toml::to_string_pretty(&config)?;

    // Add comments
    let content = format!(
        r#"# Telepub Configuration
# Generated by telepub gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_call(config: &OrchestratorConfig, method: &str, payload: Option<&str>) -> anyhow::Result<()> {
    let method: Method = method.parse()?;
    ensure_published_nodes(&config.published_nodes_path)?;
    let reconciler = PublishedNodesReconciler::from_config(config);
    reconciler.refresh_from_file();

    match invoke(&reconciler, method, payload) {
        Ok(result) => {
            if !result.is_null() {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} failed: {}", method, e);
            std::process::exit(1);
        }
    }
}
