//! BrokerCluster Controller
//!
//! Drives every `BrokerCluster` through
//! `Validating → Processing → StatusProjecting → Committing → Done | Requeue`.
//! Reconciliations are triggered by changes to the cluster, its StatefulSet
//! and its pods, and by the forced-reconcile channel fed by the config handler
//! registry.

use crate::config::OperatorConfig;
use crate::config_handler::ConfigHandlerRegistry;
use crate::crd::{BrokerCluster, BrokerClusterStatus};
use crate::error::{OperatorError, Result};
use crate::naming::{ClusterKey, ObjectKey, CLUSTER_LABEL};
use crate::resources::Provisioner;
use crate::status::{self, is_quiescent, status_equal};
use crate::store::{is_conflict, KubeStore};
use crate::validation::Validator;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, instrument, warn, Span};

/// Stage of one cluster reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Validating,
    Processing,
    StatusProjecting,
    Committing,
    Done,
    Requeue,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileState::Validating => "Validating",
            ReconcileState::Processing => "Processing",
            ReconcileState::StatusProjecting => "StatusProjecting",
            ReconcileState::Committing => "Committing",
            ReconcileState::Done => "Done",
            ReconcileState::Requeue => "Requeue",
        };
        f.write_str(s)
    }
}

fn enter(state: ReconcileState) {
    Span::current().record("state", tracing::field::display(state));
    debug!(%state, "Reconcile state");
}

/// Context passed to the cluster controller
pub struct Context {
    pub store: Arc<dyn KubeStore>,
    pub registry: Arc<ConfigHandlerRegistry>,
    pub provisioner: Arc<dyn Provisioner>,
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
}

/// Metrics for one controller, labelled by controller name
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!(
                "broker_operator_reconciliations_total",
                "controller" => controller
            ),
            errors: metrics::counter!(
                "broker_operator_reconciliation_errors_total",
                "controller" => controller
            ),
            duration: metrics::histogram!(
                "broker_operator_reconciliation_duration_seconds",
                "controller" => controller
            ),
        }
    }
}

/// Api for `K` in `namespace`, or across all namespaces when `None`
pub(crate) fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Start the BrokerCluster controller
///
/// `triggers` is the receiving end of the registry's forced-reconcile channel.
pub async fn run_controller(
    client: Client,
    ctx: Arc<Context>,
    triggers: UnboundedReceiver<ObjectRef<BrokerCluster>>,
) -> Result<()> {
    let namespace = ctx.config.namespace.clone();
    let clusters: Api<BrokerCluster> = scoped_api(&client, namespace.as_deref());
    let statefulsets: Api<StatefulSet> = scoped_api(&client, namespace.as_deref());
    let pods: Api<Pod> = scoped_api(&client, namespace.as_deref());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting BrokerCluster controller"
    );

    Controller::new(clusters, Config::default())
        .owns(statefulsets, Config::default())
        .watches(pods, Config::default().labels(CLUSTER_LABEL), |pod: Pod| {
            let cluster = pod.labels().get(CLUSTER_LABEL)?.clone();
            let namespace = pod.namespace()?;
            Some(ObjectRef::<BrokerCluster>::new(&cluster).within(&namespace))
        })
        .reconcile_on(UnboundedReceiverStream::new(triggers))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<BrokerCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = reconcile_cluster(&ObjectKey::of(cluster.as_ref()), &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.errors.increment(1);
        }
    }
    result
}

/// Run one pass of the state machine for `key`
///
/// A provisioning error is still reflected in the committed status before it
/// is returned.
#[instrument(skip(key, ctx), fields(cluster = %key, state = tracing::field::Empty))]
pub async fn reconcile_cluster(key: &ClusterKey, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();
    let Some(cluster) = store.get_cluster(key).await? else {
        debug!("BrokerCluster no longer exists");
        return Ok(Action::await_change());
    };

    enter(ReconcileState::Validating);
    let outcome = Validator::new(store, &ctx.config).validate(&cluster).await?;

    let mut provisioning = Ok(());
    if outcome.is_valid() {
        enter(ReconcileState::Processing);
        let handler = ctx.registry.lookup(key).await;
        provisioning = ctx.provisioner.provision(&cluster, handler.as_deref()).await;
        if let Err(ref e) = provisioning {
            warn!(error = %e, "Provisioning failed");
        }
    } else {
        info!(
            reason = %outcome.condition.reason,
            message = %outcome.condition.message,
            "Skipping processing of invalid BrokerCluster"
        );
    }

    enter(ReconcileState::StatusProjecting);
    let observed = status::observe(store, &cluster).await?;
    let provisioning_error = provisioning.as_ref().err().map(ToString::to_string);
    let projected = status::project(
        &cluster,
        cluster.status.as_ref(),
        &outcome.condition,
        provisioning_error.as_deref(),
        &observed,
    );

    enter(ReconcileState::Committing);
    commit_status(store, key, &projected).await?;

    if let Err(e) = provisioning {
        enter(ReconcileState::Requeue);
        return Err(e);
    }

    let has_extra_mounts = !cluster.spec.deployment_plan.extra_mounts.is_empty();
    if has_extra_mounts || outcome.retry || !is_quiescent(&projected) {
        enter(ReconcileState::Requeue);
        return Ok(Action::requeue(ctx.config.resync_period));
    }
    enter(ReconcileState::Done);
    Ok(Action::await_change())
}

/// Write `status` once if it differs from the persisted one
///
/// Uses the read resource version for optimistic concurrency. A conflict
/// means a newer version is on its way and is dropped.
async fn commit_status(
    store: &dyn KubeStore,
    key: &ClusterKey,
    status: &BrokerClusterStatus,
) -> Result<()> {
    let Some(current) = store.get_cluster(key).await? else {
        return Ok(());
    };
    if current
        .status
        .as_ref()
        .is_some_and(|existing| status_equal(existing, status))
    {
        debug!("Status unchanged");
        return Ok(());
    }

    match store
        .patch_cluster_status(key, current.metadata.resource_version.as_deref(), status)
        .await
    {
        Ok(()) => {
            debug!("Status committed");
            Ok(())
        }
        Err(e) if is_conflict(&e) => {
            debug!("Status commit conflicted, dropping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Requeue on the resync period when the error asks for it
pub fn error_policy(cluster: Arc<BrokerCluster>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    match error.requeue_delay(ctx.config.resync_period) {
        Some(delay) => {
            warn!(
                name = %cluster.name_any(),
                error = %error,
                kind = error.kind(),
                requeue_secs = delay.as_secs(),
                "Reconciliation error, requeueing"
            );
            Action::requeue(delay)
        }
        None => {
            error!(
                name = %cluster.name_any(),
                error = %error,
                kind = error.kind(),
                "Reconciliation error, waiting for a change"
            );
            Action::await_change()
        }
    }
}
