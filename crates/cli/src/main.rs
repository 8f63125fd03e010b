#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, ArgGroup, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use keel_core::{columns::summarize, DynamicDoc, Error, Propagation, Representation, ResourceDescriptor, Typed};
use keel_kubehub::{KubeTransport, MemoryTransport, Transport};
use keel_ops::{Lifecycle, Mutation, PhaseError, RetryPolicy, StatefulWorkload, WorkloadSpec};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Manage the book-server StatefulSet and its NodePort Service")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig file (default: KUBECONFIG, ~/.kube/config or in-cluster)
    #[arg(long, global = true, env = "KEEL_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,

    #[arg(short = 'n', long = "namespace", global = true, env = "KEEL_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of the StatefulSet and Service
    #[arg(long, global = true, default_value = "book-server")]
    name: String,

    /// Object representation used for the StatefulSet
    #[arg(long, value_enum, global = true, default_value_t = Repr::Typed)]
    repr: Repr,

    /// Per-request timeout in seconds
    #[arg(long = "request-timeout-secs", global = true, env = "KEEL_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// Use an in-process control plane instead of a cluster
    #[arg(long = "in-memory", global = true, action = ArgAction::SetTrue)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Repr { Typed, Dynamic }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PropagationArg { Foreground, Background, Orphan }

impl From<PropagationArg> for Propagation {
    fn from(p: PropagationArg) -> Self {
        match p {
            PropagationArg::Foreground => Propagation::Foreground,
            PropagationArg::Background => Propagation::Background,
            PropagationArg::Orphan => Propagation::Orphan,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the StatefulSet
    Create {
        #[arg(long, value_parser = clap::value_parser!(i32).range(0..))]
        replicas: Option<i32>,
        #[arg(long)]
        image: Option<String>,
    },
    /// Change the StatefulSet, retrying on write conflicts
    #[command(group(ArgGroup::new("change").required(true).multiple(true).args(["replicas", "image"])))]
    Update {
        #[arg(long, value_parser = clap::value_parser!(i32).range(0..))]
        replicas: Option<i32>,
        #[arg(long)]
        image: Option<String>,
        /// Read-modify-write cycles before giving up (overrides KEEL_UPDATE_MAX_ATTEMPTS)
        #[arg(long = "max-attempts")]
        max_attempts: Option<u32>,
        /// Delay between cycles in milliseconds (overrides KEEL_UPDATE_BACKOFF_MS)
        #[arg(long = "backoff-ms")]
        backoff_ms: Option<u64>,
    },
    /// Delete the StatefulSet
    Delete {
        #[arg(long, value_enum, default_value_t = PropagationArg::Foreground)]
        propagation: PropagationArg,
    },
    /// Show the StatefulSet
    Get,
    /// List objects; StatefulSets unless a kind key is given
    List {
        /// Kind key, e.g. "v1/Service" or "apps/v1/StatefulSet"
        gvk: Option<String>,
        /// List across all namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
    },
    /// Create the NodePort Service
    Expose {
        #[arg(long = "node-port", default_value_t = 30080)]
        node_port: i32,
    },
    /// Delete the NodePort Service
    Unexpose,
    /// Create, update, then delete the StatefulSet
    Run {
        /// Replica count set by the update phase
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i32).range(0..))]
        replicas: i32,
        #[arg(long)]
        image: Option<String>,
        #[arg(long, value_enum, default_value_t = PropagationArg::Foreground)]
        propagation: PropagationArg,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Where objects live: a real cluster or the in-process control plane.
enum Backend {
    Cluster { client: kube::Client, timeout: Option<Duration> },
    Memory,
}

impl Backend {
    async fn resolve(cli: &Cli, cancel: &CancellationToken) -> Result<Self> {
        if cli.in_memory {
            info!("using in-process control plane");
            return Ok(Backend::Memory);
        }
        let client = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
            client = keel_kubehub::connect(cli.kubeconfig.as_deref(), cli.context.as_deref()) => client?,
        };
        Ok(Backend::Cluster { client, timeout: cli.request_timeout_secs.map(Duration::from_secs) })
    }

    fn transport<R: Representation>(&self, descriptor: ResourceDescriptor) -> Arc<dyn Transport<R>> {
        match self {
            Backend::Cluster { client, timeout } => {
                Arc::new(KubeTransport::<R>::new(client.clone(), descriptor).with_request_timeout(*timeout))
            }
            Backend::Memory => Arc::new(MemoryTransport::<R>::new(descriptor)),
        }
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<PhaseError>() {
        return e.exit_code();
    }
    err.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1)
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling");
                cancel.cancel();
            }
        }
    });

    if let Err(e) = execute(&cli, cancel).await {
        error!(error = %e, "keelctl failed");
        eprintln!("error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

async fn execute(cli: &Cli, cancel: CancellationToken) -> Result<()> {
    let backend = Backend::resolve(cli, &cancel).await?;
    match cli.repr {
        Repr::Typed => dispatch::<Typed<StatefulSet>>(cli, &backend, cancel).await,
        Repr::Dynamic => dispatch::<DynamicDoc>(cli, &backend, cancel).await,
    }
}

async fn dispatch<R: StatefulWorkload>(cli: &Cli, backend: &Backend, cancel: CancellationToken) -> Result<()> {
    let spec = WorkloadSpec::named(&cli.name);
    let lc = Lifecycle::new(backend.transport::<R>(ResourceDescriptor::stateful_sets(&cli.namespace)))
        .with_policy(RetryPolicy::from_env())
        .with_cancellation(cancel.clone());

    match &cli.command {
        Commands::Create { replicas, image } => {
            let spec = WorkloadSpec {
                replicas: replicas.unwrap_or(spec.replicas),
                image: image.clone().unwrap_or(spec.image.clone()),
                ..spec
            };
            let created = lc.create(&R::desired(&spec)).await?;
            print_objects(cli.output, &[created])?;
        }
        Commands::Update { replicas, image, max_attempts, backoff_ms } => {
            let mut policy = lc.policy().clone();
            if let Some(n) = max_attempts {
                policy.max_attempts = *n;
            }
            if let Some(ms) = backoff_ms {
                policy.initial_backoff = Duration::from_millis(*ms);
            }
            let lc = lc.with_policy(policy);
            let m = Mutation { replicas: *replicas, image: image.clone() };
            let out = lc.update(&cli.name, |obj: &mut R| obj.apply(&m)).await?;
            info!(name = %cli.name, attempts = out.attempts, "update committed");
            print_objects(cli.output, &[out.object])?;
        }
        Commands::Delete { propagation } => {
            lc.delete(&cli.name, (*propagation).into()).await?;
            if cli.output == Output::Human {
                println!("statefulset {:?} deleted", cli.name);
            }
        }
        Commands::Get => print_objects(cli.output, &[lc.get(&cli.name).await?])?,
        Commands::List { gvk, all_namespaces } => {
            let ns = (!*all_namespaces).then_some(cli.namespace.as_str());
            match gvk {
                Some(key) => {
                    let d = ResourceDescriptor::parse(key, ns)?;
                    let lc: Lifecycle<DynamicDoc, dyn Transport<DynamicDoc>> =
                        Lifecycle::new(backend.transport(d)).with_cancellation(cancel);
                    print_objects(cli.output, &lc.list().await?)?;
                }
                None => {
                    let d = ResourceDescriptor::stateful_sets(&cli.namespace).in_namespace(ns);
                    let lc = Lifecycle::<R, dyn Transport<R>>::new(backend.transport(d)).with_cancellation(cancel);
                    print_objects(cli.output, &lc.list().await?)?;
                }
            }
        }
        Commands::Expose { node_port } => {
            let spec = WorkloadSpec { node_port: *node_port, ..spec };
            let svc = service_lifecycle(cli, backend, cancel).create(&spec.service()).await?;
            print_objects(cli.output, &[svc])?;
        }
        Commands::Unexpose => {
            service_lifecycle(cli, backend, cancel).delete(&cli.name, Propagation::Foreground).await?;
            if cli.output == Output::Human {
                println!("service {:?} deleted", cli.name);
            }
        }
        Commands::Run { replicas, image, propagation } => {
            let human = cli.output == Output::Human;
            let m = Mutation { replicas: Some(*replicas), image: image.clone() };
            if human {
                println!("Creating statefulset {:?} in {:?}...", cli.name, cli.namespace);
            }
            let created = lc.create(&R::desired(&spec)).await?;
            if human {
                println!("Created statefulset {:?} (resourceVersion {})", cli.name, created.resource_version().unwrap_or("-"));
                println!("Updating statefulset...");
            }
            let out = lc.update(&cli.name, |obj: &mut R| obj.apply(&m)).await?;
            if human {
                println!(
                    "Updated statefulset after {} attempt(s) (resourceVersion {})",
                    out.attempts,
                    out.object.resource_version().unwrap_or("-")
                );
                println!("Deleting statefulset...");
            }
            lc.delete(&cli.name, (*propagation).into()).await?;
            if human {
                println!("Deleted statefulset.");
            } else {
                print_objects(cli.output, &[out.object])?;
            }
        }
    }
    Ok(())
}

fn service_lifecycle(cli: &Cli, backend: &Backend, cancel: CancellationToken) -> Lifecycle<Typed<Service>, dyn Transport<Typed<Service>>> {
    Lifecycle::new(backend.transport(ResourceDescriptor::services(&cli.namespace))).with_cancellation(cancel)
}

fn print_objects<R: Representation>(output: Output, objs: &[R]) -> Result<()> {
    let docs = objs.iter().map(|o| o.to_document()).collect::<Result<Vec<_>, _>>()?;
    match output {
        Output::Human => print!("{}", render_table(&docs)),
        Output::Json => match docs.as_slice() {
            [one] => println!("{}", serde_json::to_string_pretty(one)?),
            many => println!("{}", serde_json::to_string_pretty(many)?),
        },
        Output::Yaml => match docs.as_slice() {
            [one] => print!("{}", serde_yaml::to_string(one)?),
            many => print!("{}", serde_yaml::to_string(many)?),
        },
    }
    Ok(())
}

fn render_table(docs: &[Value]) -> String {
    let rows: Vec<Vec<(&'static str, String)>> = docs
        .iter()
        .map(|d| {
            let api_version = d.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
            let kind = d.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            let mut row: Vec<_> = summarize(api_version, kind, d).into_iter().map(|c| (c.label, c.value)).collect();
            let created = d.pointer("/metadata/creationTimestamp").and_then(|v| v.as_str());
            row.push(("AGE", render_age(created, chrono::Utc::now())));
            row
        })
        .collect();
    let Some(first) = rows.first() else { return "No resources found.\n".to_string() };
    let mut widths: Vec<usize> = first.iter().map(|(label, _)| label.len()).collect();
    for row in &rows {
        for (w, (_, value)) in widths.iter_mut().zip(row) {
            *w = (*w).max(value.len());
        }
    }
    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells.iter().zip(&widths).map(|(c, w)| format!("{:<width$}", c, width = w)).collect();
        format!("{}\n", padded.join("   ").trim_end())
    };
    let mut out = line(first.iter().map(|(label, _)| *label).collect());
    for row in &rows {
        out.push_str(&line(row.iter().map(|(_, v)| v.as_str()).collect()));
    }
    out
}

fn render_age(created: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> String {
    let Some(ts) = created.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else { return "-".to_string() };
    let mut secs = now.signed_duration_since(ts).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use keel_ops::Phase;
    use serde_json::json;

    #[test]
    fn command_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from(["keelctl", "list", "-n", "prod", "--repr", "dynamic", "-o", "yaml"]).expect("parse");
        assert_eq!(cli.namespace, "prod");
        assert_eq!(cli.repr, Repr::Dynamic);
        assert_eq!(cli.output, Output::Yaml);
        assert_eq!(cli.name, "book-server");
        assert!(matches!(cli.command, Commands::List { gvk: None, all_namespaces: false }));
    }

    #[test]
    fn list_takes_a_kind_key_and_all_namespaces() {
        let cli = Cli::try_parse_from(["keelctl", "list", "v1/Service", "-A"]).expect("parse");
        match cli.command {
            Commands::List { gvk, all_namespaces } => {
                assert_eq!(gvk.as_deref(), Some("v1/Service"));
                assert!(all_namespaces);
                let d = ResourceDescriptor::parse("v1/Service", None).expect("key");
                assert_eq!(d, ResourceDescriptor::services("default").in_namespace(None));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn update_needs_a_change() {
        assert!(Cli::try_parse_from(["keelctl", "update"]).is_err());
        assert!(Cli::try_parse_from(["keelctl", "update", "--replicas", "-1"]).is_err());
        let cli = Cli::try_parse_from(["keelctl", "update", "--replicas", "1", "--max-attempts", "7"]).expect("parse");
        match cli.command {
            Commands::Update { replicas, image, max_attempts, backoff_ms } => {
                assert_eq!(replicas, Some(1));
                assert_eq!(image, None);
                assert_eq!(max_attempts, Some(7));
                assert_eq!(backoff_ms, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn delete_defaults_to_foreground() {
        let cli = Cli::try_parse_from(["keelctl", "delete"]).expect("parse");
        assert!(matches!(cli.command, Commands::Delete { propagation: PropagationArg::Foreground }));
        let cli = Cli::try_parse_from(["keelctl", "delete", "--propagation", "orphan"]).expect("parse");
        match cli.command {
            Commands::Delete { propagation } => assert_eq!(Propagation::from(propagation), Propagation::Orphan),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn exit_codes_follow_the_error_kind() {
        let phase = PhaseError {
            phase: Phase::Update,
            kind: "StatefulSet".into(),
            name: "book-server".into(),
            source: Error::RetryExhausted { name: "book-server".into(), attempts: 5 },
        };
        assert_eq!(exit_code(&anyhow::Error::new(phase)), 5);
        assert_eq!(exit_code(&anyhow::Error::new(Error::Cancelled)), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn table_lines_up_columns() {
        let docs = vec![
            json!({ "apiVersion": "apps/v1", "kind": "StatefulSet",
                    "metadata": { "name": "book-server", "resourceVersion": "2" },
                    "spec": { "replicas": 1, "template": { "spec": { "containers": [{ "name": "c", "image": "img:1" }] } } } }),
            json!({ "apiVersion": "apps/v1", "kind": "StatefulSet",
                    "metadata": { "name": "a", "resourceVersion": "17" },
                    "spec": { "replicas": 3 } }),
        ];
        let table = render_table(&docs);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME          READY   IMAGES   RV   AGE"), "{}", lines[0]);
        assert!(lines[1].starts_with("book-server   0/1     img:1    2    -"), "{}", lines[1]);
        assert!(lines[2].starts_with("a             0/3     -        17   -"), "{}", lines[2]);
        assert_eq!(render_table(&[]), "No resources found.\n");
    }

    #[test]
    fn age_is_compact() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-05-02T12:00:00Z").expect("ts").with_timezone(&chrono::Utc);
        assert_eq!(render_age(Some("2024-05-02T11:59:30Z"), now), "30s");
        assert_eq!(render_age(Some("2024-05-02T10:15:00Z"), now), "1h45m");
        assert_eq!(render_age(Some("2024-04-30T09:00:00Z"), now), "2d3h");
        assert_eq!(render_age(Some("not a time"), now), "-");
        assert_eq!(render_age(None, now), "-");
    }
}
