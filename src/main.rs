use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use kube::ResourceExt;
use pgcluster_k8s::cluster::Cluster;
use pgcluster_k8s::config::{parse_duration, OperatorConfig};
use pgcluster_k8s::controller::{self, LeaderElectionSettings};
use pgcluster_k8s::k8s::NamespacedName;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Print the switchover candidate for a primary pod
    Candidate(CandidateArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// YAML configuration file
    #[arg(long, env = "PGCLUSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Only watch this namespace
    #[arg(long, env = "WATCHED_NAMESPACE")]
    watched_namespace: Option<String>,

    /// Number of migration workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Node label a ready node must carry, as key=value (repeatable)
    #[arg(long = "node-readiness-label", value_parser = parse_label)]
    node_readiness_label: Vec<(String, String)>,

    /// Interval of the rolling update resync, e.g. "30m"
    #[arg(long, env = "RESYNC_PERIOD", value_parser = parse_duration)]
    resync_period: Option<Duration>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    lease_namespace: String,
}

#[derive(Parser, Debug)]
struct CandidateArgs {
    /// YAML configuration file
    #[arg(long, env = "PGCLUSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace of the primary pod
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Name of the primary pod
    #[arg(long)]
    pod: String,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<OperatorConfig> {
    match path {
        Some(path) => OperatorConfig::from_yaml_file(path)
            .with_context(|| format!("could not load configuration from {}", path.display())),
        None => Ok(OperatorConfig::default()),
    }
}

impl RunArgs {
    /// Defaults, then the config file, then flags and environment
    fn operator_config(&self) -> anyhow::Result<OperatorConfig> {
        let mut config = load_config(self.config.as_ref())?;

        if let Some(ns) = &self.watched_namespace {
            config.watched_namespace = Some(ns.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if !self.node_readiness_label.is_empty() {
            config.node_readiness_label = self
                .node_readiness_label
                .iter()
                .cloned()
                .collect::<BTreeMap<_, _>>();
        }
        if let Some(period) = self.resync_period {
            config.resync_period = period;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("pgcluster-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => {
            init_tracing(args.log_format);
            run(run_args).await
        }
        Commands::Candidate(candidate_args) => {
            init_tracing(args.log_format);
            candidate(candidate_args).await
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = Arc::new(args.operator_config()?);
    info!(
        "Watching {} with {} workers",
        config.watched_namespace.as_deref().unwrap_or("all namespaces"),
        config.workers
    );

    let client = kube::Client::try_default()
        .await
        .context("could not create Kubernetes client")?;

    let election = LeaderElectionSettings {
        namespace: args.lease_namespace,
        identity: holder_identity(),
    };
    controller::run_operator(client, config, election).await?;
    Ok(())
}

async fn candidate(args: CandidateArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;
    config.validate()?;
    let config = Arc::new(config);

    let client = kube::Client::try_default()
        .await
        .context("could not create Kubernetes client")?;
    let ctx = controller::cluster_context(client, config.clone())?;

    let name = NamespacedName::new(args.namespace, args.pod);
    let pod = ctx.api.get_pod(&name).await?;
    let cluster_name = pod
        .labels()
        .get(&config.cluster_name_label)
        .cloned()
        .ok_or_else(|| anyhow!("pod {name} has no {} label", config.cluster_name_label))?;

    let cluster = Cluster::new(NamespacedName::new(name.namespace.clone(), cluster_name), ctx);
    let candidate = cluster.get_switchover_candidate(&pod).await?;
    println!("{candidate}");
    Ok(())
}
