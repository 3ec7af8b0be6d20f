//! Broker Kubernetes Operator
//!
//! Manages BrokerCluster and BrokerAddress custom resources: deploys the
//! broker replicas and keeps their addresses and queues in sync.

use anyhow::{Context as _, Result};
use broker_operator::address_controller::{run_address_controller, AddressController};
use broker_operator::config::{OperatorConfig, DEFAULT_MANAGEMENT_PORT};
use broker_operator::config_handler::ConfigHandlerRegistry;
use broker_operator::controller::{run_controller, Context, ControllerMetrics};
use broker_operator::crd::{BrokerAddress, BrokerCluster};
use broker_operator::management::{HttpConnector, ManagementClientConfig};
use broker_operator::naming::DEFAULT_CLUSTER_DOMAIN;
use broker_operator::resources::KubeProvisioner;
use broker_operator::store::KubeApiStore;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Broker Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "broker-operator")]
#[command(about = "Kubernetes operator for multi-replica message broker clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Period between resync reconciliations
    #[arg(long, env = "RECONCILE_RESYNC_PERIOD", value_parser = humantime::parse_duration, default_value = "30s")]
    resync_period: Duration,

    /// Kubernetes cluster DNS domain
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    cluster_domain: String,

    /// Pattern JAAS config mounts must match (empty disables the check)
    #[arg(long, env = "JAAS_CONFIG_SYNTAX_MATCH_REGEX", default_value = "")]
    jaas_config_syntax: String,

    /// Deadline for a single broker management call
    #[arg(long, env = "MANAGEMENT_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    management_timeout: Duration,

    /// Deadline for connecting to a broker management endpoint
    #[arg(long, env = "MANAGEMENT_CONNECT_TIMEOUT", value_parser = humantime::parse_duration, default_value = "10s")]
    management_connect_timeout: Duration,

    /// Broker management port
    #[arg(long, env = "MANAGEMENT_PORT", default_value_t = DEFAULT_MANAGEMENT_PORT)]
    management_port: u16,

    /// CA bundle (PEM) trusted for HTTPS management endpoints
    #[arg(long, env = "MANAGEMENT_CA_CERT", default_value = "")]
    management_ca_cert: String,

    /// Skip certificate verification for HTTPS management endpoints
    #[arg(long, env = "MANAGEMENT_INSECURE_SKIP_VERIFY", default_value = "false")]
    management_insecure_skip_verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> Result<OperatorConfig> {
        let config = OperatorConfig {
            resync_period: self.resync_period,
            management_timeout: self.management_timeout,
            management_connect_timeout: self.management_connect_timeout,
            management_port: self.management_port,
            management_insecure: self.management_insecure_skip_verify,
            ..Default::default()
        }
        .with_namespace(&self.namespace)
        .with_cluster_domain(&self.cluster_domain)
        .with_management_ca_cert(&self.management_ca_cert)
        .with_jaas_syntax(&self.jaas_config_syntax)
        .context("Invalid JAAS_CONFIG_SYNTAX_MATCH_REGEX")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;
    let config = args.operator_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        resync_secs = config.resync_period.as_secs(),
        cluster_domain = %config.cluster_domain,
        "Starting Broker Kubernetes Operator"
    );

    // installed before any controller registers its metrics
    start_metrics_server(args.metrics_addr)?;

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = Arc::new(KubeApiStore::new(client.clone()));
    let connector = Arc::new(
        HttpConnector::new(ManagementClientConfig::from(config.clone()))
            .context("Failed to create management connector")?,
    );

    let (cluster_trigger, cluster_triggers) = mpsc::unbounded_channel();
    let ctx = Arc::new(Context {
        store: store.clone(),
        registry: Arc::new(ConfigHandlerRegistry::new(store.clone(), cluster_trigger)),
        provisioner: Arc::new(KubeProvisioner::new(client.clone())),
        config: config.clone(),
        metrics: Some(ControllerMetrics::new("cluster")),
    });

    let (address_trigger, address_triggers) = mpsc::unbounded_channel();
    let addresses =
        Arc::new(AddressController::new(store, connector, config, address_trigger).with_metrics());

    tokio::try_join!(
        async {
            run_controller(client.clone(), ctx, cluster_triggers)
                .await
                .context("BrokerCluster controller failed")
        },
        async {
            run_address_controller(client.clone(), addresses, address_triggers)
                .await
                .context("BrokerAddress controller failed")
        },
    )?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Install the Prometheus recorder and its HTTP listener
fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print both CRDs as a multi-document YAML stream
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let cluster = serde_yaml::to_string(&BrokerCluster::crd())?;
    let address = serde_yaml::to_string(&BrokerAddress::crd())?;
    println!("{}---\n{}", cluster, address);

    Ok(())
}
