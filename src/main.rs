//! camfleet - run a camera / recorder / agent fleet on Kubernetes

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use camfleet::cluster::{ClusterClient, InMemoryCluster, KubeCluster};
use camfleet::config::OrchestratorConfig;
use camfleet::model::Workload;
use camfleet::spec::SpecGenerator;
use camfleet::store::MemoryStore;
use camfleet::telemetry::{self, LogFormat};
use camfleet::{CreateRequest, Orchestrator};

/// camfleet - lifecycle orchestrator for camera, recorder and agent workloads
#[derive(Parser, Debug)]
#[command(name = "camfleet", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "CAMFLEET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the manifests generated for one workload descriptor
    Render {
        /// Workload descriptor YAML
        #[arg(short = 'f', long = "file")]
        file: PathBuf,

        #[command(flatten)]
        config: OrchestratorConfig,
    },

    /// Apply a fleet and keep it reconciled until interrupted
    ///
    /// Creates every workload in the fleet file, then sweeps orphans and
    /// refreshes status on the sweep interval. Entries with a fixed `id`
    /// adopt the objects a previous run left for them. Ctrl-C waits for
    /// in-flight deletions before exiting.
    Run {
        /// Fleet YAML (`workloads:` list of descriptors)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,

        /// Delete every object a previous run left before creating the fleet
        #[arg(long)]
        reset: bool,

        /// Use an in-memory cluster instead of connecting
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        config: OrchestratorConfig,
    },
}

/// Fleet file layout
#[derive(Debug, Deserialize)]
struct Fleet {
    workloads: Vec<FleetEntry>,
}

/// One fleet workload, optionally pinned to a stable id
#[derive(Debug, Deserialize)]
struct FleetEntry {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(flatten)]
    request: CreateRequest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    match cli.command {
        Commands::Render { file, config } => render(&file, &config),
        Commands::Run {
            file,
            reset,
            dry_run,
            config,
        } => run(&file, reset, dry_run, config).await,
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn render(file: &Path, config: &OrchestratorConfig) -> anyhow::Result<()> {
    let request: CreateRequest = read_yaml(file)?;
    let workload = Workload::new(request.name, request.kind, request.config);
    let generated = SpecGenerator::from_config(config).generate(&workload)?;

    for object in generated.to_objects()? {
        println!("---");
        print!("{}", serde_yaml::to_string(&object.body)?);
    }
    Ok(())
}

async fn run(
    file: &Path,
    reset: bool,
    dry_run: bool,
    config: OrchestratorConfig,
) -> anyhow::Result<()> {
    let fleet: Fleet = read_yaml(file)?;

    let cluster: Arc<dyn ClusterClient> = if dry_run {
        info!("dry run: using in-memory cluster");
        Arc::new(InMemoryCluster::new())
    } else {
        let client = Client::try_default()
            .await
            .context("failed to connect to the cluster")?;
        Arc::new(KubeCluster::new(client, &config.namespace))
    };

    let orchestrator = Arc::new(Orchestrator::from_config(
        &config,
        cluster,
        Arc::new(MemoryStore::new()),
    ));

    // The store starts empty, so a sweep here clears everything a previous
    // run left, including objects the fleet's pinned ids would adopt
    if reset {
        let report = orchestrator.sweep().await?;
        info!(deleted = report.deleted.len(), "cleared previous run");
    }

    for FleetEntry { id, request } in fleet.workloads {
        let name = request.name.clone();
        let id = id.unwrap_or_else(Uuid::new_v4);
        match orchestrator.create_with_id(id, request).await {
            Ok(w) => info!(workload = %w.id, name = %name, "created"),
            Err(e) => error!(name = %name, error = %e, retryable = e.is_retryable(), "create failed"),
        }
    }

    let shutdown = CancellationToken::new();
    let sweeper = {
        let sweeper = orchestrator.sweeper().clone();
        let token = shutdown.clone();
        let interval = config.timings.sweep_interval;
        tokio::spawn(async move { sweeper.run_periodic(interval, token).await })
    };

    let mut ticker = tokio::time::interval(config.timings.sweep_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => match orchestrator.list().await {
                Ok(rows) => {
                    for w in rows {
                        info!(workload = %w.id, name = %w.name, status = %w.status, "status");
                    }
                }
                Err(e) => warn!(error = %e, "status refresh failed"),
            },
        }
    }

    info!("shutting down");
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task failed");
    }
    orchestrator.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camfleet::model::WorkloadKind;

    #[test]
    fn fleet_entries_keep_pinned_ids() {
        let fleet: Fleet = serde_yaml::from_str(
            r#"
workloads:
  - id: 6f1c2a3e-0b7d-4c55-9a51-2f0e8d7c4b10
    name: Workbench
    kind: camera
    protocol: usb
    node: edge1
    devicePath: /dev/video0
  - name: Motion Summary
    kind: agent
    protocol: agent
"#,
        )
        .unwrap();

        let pinned = &fleet.workloads[0];
        assert_eq!(
            pinned.id,
            Some(Uuid::parse_str("6f1c2a3e-0b7d-4c55-9a51-2f0e8d7c4b10").unwrap())
        );
        assert_eq!(pinned.request.kind, WorkloadKind::Camera);
        assert_eq!(pinned.request.config.device_path.as_deref(), Some("/dev/video0"));

        assert!(fleet.workloads[1].id.is_none());
        assert_eq!(fleet.workloads[1].request.name, "Motion Summary");
    }

    #[test]
    fn run_keeps_previous_objects_unless_reset() {
        let cli = Cli::try_parse_from(["camfleet", "run", "-f", "fleet.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { reset: false, .. }));

        let cli = Cli::try_parse_from(["camfleet", "run", "-f", "fleet.yaml", "--reset"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { reset: true, .. }));
    }
}
