use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use skiff_core::duration::parse_duration;
use skiff_core::{
    TargetRef, TargetSpec, Timeout, WorkItem, WorkItemKey, WorkItemSpec, ABORT_TIME_ANNOTATION, OPERATION_ANNOTATION,
    OPERATION_INTERRUPT, OPERATION_RECONCILE, RECONCILE_TIME_ANNOTATION,
};
use skiff_kubehub::KubeConnector;
use skiff_persist::{default_db_path, SqliteStore, WorkItemStore};
use skiff_reconcile::{Controller, ControllerConfig, Reconciler, StoreTargetLookup};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Skiff manifest deployer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Work item database
    #[arg(long = "db", env = "SKIFF_DB_PATH", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update a work item from a provider configuration file (YAML or JSON)
    Apply {
        /// Work item as "namespace/name" or "name"
        item: String,
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Named target as "namespace/name" or "name"
        #[arg(long = "target", conflicts_with_all = ["kubeconfig", "current_context"])]
        target: Option<String>,
        /// Inline kubeconfig file
        #[arg(long = "kubeconfig", conflicts_with = "current_context")]
        kubeconfig: Option<PathBuf>,
        /// Deploy with whatever cluster this process resolves by default
        #[arg(long = "current-context", action = ArgAction::SetTrue)]
        current_context: bool,
        /// Progressing timeout for this item, e.g. "10m"
        #[arg(long = "timeout")]
        timeout: Option<String>,
    },
    /// Ask for a reconcile of an unchanged work item
    Reconcile {
        item: String,
        /// Run the reconcile in this process until it settles
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
    },
    /// Request deletion of a work item
    Delete {
        item: String,
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
    },
    /// Interrupt the running attempt of a work item
    Interrupt { item: String },
    /// Show a work item's status
    Status { item: String },
    /// List work items
    Ls,
    /// Manage named targets
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Run the controller loop until Ctrl-C
    Run {
        /// Concurrent reconciles
        #[arg(long = "workers", env = "SKIFF_WORKERS")]
        workers: Option<usize>,
        /// Store poll interval, e.g. "5s"
        #[arg(long = "poll-interval", env = "SKIFF_POLL_INTERVAL")]
        poll_interval: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum TargetCommands {
    /// Register or replace a named target
    Add {
        /// Target as "namespace/name" or "name"
        target: String,
        #[arg(long = "kubeconfig", conflicts_with = "current_context")]
        kubeconfig: Option<PathBuf>,
        #[arg(long = "current-context", action = ArgAction::SetTrue)]
        current_context: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_key(s: &str) -> Result<WorkItemKey> {
    WorkItemKey::parse(s).ok_or_else(|| anyhow!("invalid key {:?}; expected \"namespace/name\" or \"name\"", s))
}

fn target_spec(kubeconfig: Option<PathBuf>, current_context: bool) -> Result<Option<TargetSpec>> {
    match (kubeconfig, current_context) {
        (Some(path), _) => {
            let doc = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            Ok(Some(TargetSpec::Kubeconfig(doc)))
        }
        (None, true) => Ok(Some(TargetSpec::CurrentContext)),
        (None, false) => Ok(None),
    }
}

/// Provider configuration from a YAML or JSON document.
fn read_configuration(path: &PathBuf) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn open_store(db: Option<String>) -> Result<Arc<dyn WorkItemStore>> {
    let path = db.unwrap_or_else(default_db_path);
    Ok(Arc::new(SqliteStore::open(&path)?))
}

fn reconciler(store: Arc<dyn WorkItemStore>) -> Result<Arc<Reconciler>> {
    reconciler_with(store, ControllerConfig::from_env()?)
}

fn reconciler_with(store: Arc<dyn WorkItemStore>, config: ControllerConfig) -> Result<Arc<Reconciler>> {
    let connector = KubeConnector::new(StoreTargetLookup::new(store.clone()));
    Ok(Arc::new(Reconciler::new(store, Arc::new(connector), config)))
}

/// Token cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
            token.cancel();
        }
    });
    cancel
}

fn annotate(store: &dyn WorkItemStore, key: &WorkItemKey, operation: &str, time_key: &str) -> Result<()> {
    let mut ann = BTreeMap::new();
    ann.insert(OPERATION_ANNOTATION.to_string(), operation.to_string());
    ann.insert(time_key.to_string(), Utc::now().to_rfc3339());
    store.annotate(key, &ann)
}

fn print_item(item: &WorkItem, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(item)?),
        Output::Human => {
            let phase = item.status.phase.map_or("-".to_string(), |p| p.to_string());
            println!("{}  phase={}  generation={}/{}", item.key(), phase, item.status.observed_generation, item.generation);
            if item.is_deleting() {
                println!("  deleting since {}", item.deletion_timestamp.map(|t| t.to_rfc3339()).unwrap_or_default());
            }
            if let Some(e) = &item.status.last_error {
                println!("  last error: {} {}: {} (since {})", e.operation, e.reason, e.message, e.last_transition_time.to_rfc3339());
            }
            for m in item.status.managed_resources() {
                println!("  {} {}", m.policy.as_str(), m.resource);
            }
            if let Some(r) = &item.status.export_reference {
                println!("  exports: {}/{}", r.namespace, r.name);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db)?;

    match cli.command {
        Commands::Apply { item, file, target, kubeconfig, current_context, timeout } => {
            let key = parse_key(&item)?;
            let configuration = read_configuration(&file)?;
            let target = match target {
                Some(t) => {
                    let k = parse_key(&t)?;
                    Some(TargetRef { namespace: t.contains('/').then_some(k.namespace), name: k.name })
                }
                None => None,
            };
            let timeout = timeout.map(|t| Timeout::from_str(&t)).transpose().context("--timeout")?;
            let spec = WorkItemSpec { target, inline_target: target_spec(kubeconfig, current_context)?, configuration, timeout };
            if spec.target.is_none() && spec.inline_target.is_none() {
                warn!(item = %key, "no target given; the work item will fail until one is set");
            }
            let stored = store.upsert_spec(&key, spec)?;
            info!(item = %key, generation = stored.generation, "work item stored");
            print_item(&stored, cli.output)?;
        }
        Commands::Reconcile { item, wait } => {
            let key = parse_key(&item)?;
            annotate(store.as_ref(), &key, OPERATION_RECONCILE, RECONCILE_TIME_ANNOTATION)?;
            if wait {
                reconciler(store.clone())?.reconcile_until_done(&key, &ctrl_c_token()).await?;
            }
            match store.get(&key)? {
                Some(item) => print_item(&item, cli.output)?,
                None => bail!("work item {} not found", key),
            }
        }
        Commands::Delete { item, wait } => {
            let key = parse_key(&item)?;
            if !store.request_deletion(&key, Utc::now())? {
                bail!("work item {} not found", key);
            }
            if wait {
                reconciler(store.clone())?.reconcile_until_done(&key, &ctrl_c_token()).await?;
            }
            match store.get(&key)? {
                Some(item) => print_item(&item, cli.output)?,
                None => println!("{} deleted", key),
            }
        }
        Commands::Interrupt { item } => {
            let key = parse_key(&item)?;
            annotate(store.as_ref(), &key, OPERATION_INTERRUPT, ABORT_TIME_ANNOTATION)?;
            println!("interrupt requested for {}", key);
        }
        Commands::Status { item } => {
            let key = parse_key(&item)?;
            match store.get(&key)? {
                Some(item) => print_item(&item, cli.output)?,
                None => bail!("work item {} not found", key),
            }
        }
        Commands::Ls => {
            let mut items = Vec::new();
            for key in store.list_keys()? {
                if let Some(item) = store.get(&key)? {
                    items.push(item);
                }
            }
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
                Output::Human => {
                    for item in &items {
                        let phase = item.status.phase.map_or("-".to_string(), |p| p.to_string());
                        println!("{} • {} • {} object(s)", item.key(), phase, item.status.managed_resources().len());
                    }
                }
            }
        }
        Commands::Target { command: TargetCommands::Add { target, kubeconfig, current_context } } => {
            let key = parse_key(&target)?;
            let Some(spec) = target_spec(kubeconfig, current_context)? else {
                bail!("either --kubeconfig or --current-context is required");
            };
            store.put_target(&key.namespace, &key.name, &spec)?;
            println!("target {} stored", key);
        }
        Commands::Run { workers, poll_interval } => {
            let mut config = ControllerConfig::from_env()?;
            if let Some(n) = workers {
                config.workers = n.max(1);
            }
            if let Some(p) = poll_interval {
                config.poll_interval = parse_duration(&p).context("--poll-interval")?;
            }
            let reconciler = reconciler_with(store, config)?;
            Controller::new(reconciler).run(ctrl_c_token()).await?;
            warn!("controller stopped");
        }
    }
    Ok(())
}
