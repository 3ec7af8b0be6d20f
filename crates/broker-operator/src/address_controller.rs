//! BrokerAddress Controller
//!
//! Finalizer-driven lifecycle for address declarations. Applying a declaration
//! synchronizes it onto every targeted broker replica, unless its resource
//! version matches the last successfully applied one (kept in memory and in
//! an idempotence record). Deleting it optionally removes it from the brokers.
//!
//! A pod observer watches the broker pods. When a replica comes back Ready
//! with a new UID, every deployment targeting its cluster is invalidated and
//! re-triggered, so restarted brokers get their addresses and queues back.

use crate::config::OperatorConfig;
use crate::controller::{scoped_api, ControllerMetrics};
use crate::crd::{BrokerAddress, BrokerAddressSpec};
use crate::error::{OperatorError, Result};
use crate::idempotence::{IdempotenceCache, ReconciledRecord};
use crate::management::ManagementConnector;
use crate::naming::{
    address_labels, cluster_name_for_statefulset, pod_ordinal, statefulset_name, ObjectKey,
    TargetSelector, CLUSTER_LABEL,
};
use crate::status::is_pod_ready;
use crate::store::KubeStore;
use crate::synchronizer::Synchronizer;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer name for cleanup operations
pub const ADDRESS_FINALIZER: &str = "broker.operator.dev/address-finalizer";

/// Kind tag of address idempotence records
pub const RECORD_KIND: &str = "address";

/// Sender side of the address controller's forced-reconcile channel
pub type AddressTrigger = UnboundedSender<ObjectRef<BrokerAddress>>;

/// Last known deployment of one address declaration
#[derive(Debug, Clone)]
pub struct AddressDeployment {
    pub spec: BrokerAddressSpec,
    pub selector: TargetSelector,
    /// Resource version last applied successfully, `None` when it must be
    /// (re)applied
    pub checksum: Option<String>,
}

/// StatefulSet owning a broker pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodOwner {
    pub statefulset: String,
    pub ordinal: u32,
    pub labels: BTreeMap<String, String>,
}

pub struct AddressController {
    store: Arc<dyn KubeStore>,
    synchronizer: Synchronizer,
    cache: IdempotenceCache,
    deployments: DashMap<ObjectKey, AddressDeployment>,
    /// UID of the last Ready incarnation seen per pod
    ready_pods: DashMap<ObjectKey, String>,
    trigger: AddressTrigger,
    config: OperatorConfig,
    managed: Option<metrics::Gauge>,
}

impl AddressController {
    pub fn new(
        store: Arc<dyn KubeStore>,
        connector: Arc<dyn ManagementConnector>,
        config: OperatorConfig,
        trigger: AddressTrigger,
    ) -> Self {
        Self {
            synchronizer: Synchronizer::new(store.clone(), connector, config.cluster_domain.clone()),
            cache: IdempotenceCache::new(store.clone()),
            store,
            deployments: DashMap::new(),
            ready_pods: DashMap::new(),
            trigger,
            config,
            managed: None,
        }
    }

    /// Report the number of tracked deployments on a gauge
    pub fn with_metrics(mut self) -> Self {
        self.managed = Some(metrics::gauge!("broker_operator_managed_addresses"));
        self
    }

    /// Number of tracked address deployments
    pub fn deployments(&self) -> usize {
        self.deployments.len()
    }

    fn update_gauge(&self) {
        if let Some(ref gauge) = self.managed {
            gauge.set(self.deployments.len() as f64);
        }
    }

    /// Synchronize `address` onto its target replicas unless already applied
    #[instrument(skip(self, address), fields(name = %address.name_any(), namespace = address.namespace()))]
    pub async fn apply(&self, address: &BrokerAddress) -> Result<Action> {
        let key = ObjectKey::of(address);
        let spec = &address.spec;
        if let Err(errors) = spec.validate() {
            warn!(errors = %errors, "BrokerAddress spec validation failed");
            return Err(OperatorError::InvalidConfig(errors.to_string()));
        }

        let checksum = address.resource_version().unwrap_or_default();
        let requeue = Action::requeue(self.config.resync_period);

        let applied = self
            .deployments
            .get(&key)
            .is_some_and(|d| d.checksum.as_deref() == Some(checksum.as_str()));
        if applied {
            debug!(checksum = %checksum, "Address unchanged since last apply");
            return Ok(requeue);
        }

        let selector = TargetSelector::from_names(&spec.apply_to_cluster_names);
        let labels = address_labels(&key.name);
        let tracked = self.deployments.contains_key(&key);
        if !tracked {
            match self
                .cache
                .is_unchanged(&key, RECORD_KIND, &labels, &checksum)
                .await
            {
                Ok(true) => {
                    debug!(checksum = %checksum, "Address matches reconciled record");
                    self.track(&key, spec, selector, Some(checksum));
                    return Ok(requeue);
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to read reconciled record"),
            }
        }

        // tracked before syncing so a restarted replica re-triggers a failed apply
        self.track(&key, spec, selector.clone(), None);
        self.synchronizer.apply(&key.namespace, spec).await?;
        self.track(&key, spec, selector, Some(checksum.clone()));
        info!(address = %spec.address_name, queue = spec.queue(), "Address applied");

        let record = ReconciledRecord {
            owner: key.clone(),
            kind: RECORD_KIND.to_string(),
            snapshot: serde_json::to_string(address)?,
            checksum,
            labels,
        };
        if let Err(e) = self.cache.store(&record).await {
            warn!(error = %e, "Failed to persist reconciled record");
        }
        Ok(requeue)
    }

    /// Remove `address` from the brokers when asked to, and forget it
    #[instrument(skip(self, address), fields(name = %address.name_any(), namespace = address.namespace()))]
    pub async fn cleanup(&self, address: &BrokerAddress) -> Result<Action> {
        let key = ObjectKey::of(address);
        if address.spec.remove_from_broker_on_delete {
            self.synchronizer.remove(&key.namespace, &address.spec).await?;
            info!(address = %address.spec.address_name, "Address removed from brokers");
        } else {
            debug!("Keeping address on brokers");
        }

        if let Err(e) = self.cache.remove(&key, RECORD_KIND).await {
            warn!(error = %e, "Failed to delete reconciled record");
        }
        self.deployments.remove(&key);
        self.update_gauge();
        Ok(Action::await_change())
    }

    fn track(
        &self,
        key: &ObjectKey,
        spec: &BrokerAddressSpec,
        selector: TargetSelector,
        checksum: Option<String>,
    ) {
        self.deployments.insert(
            key.clone(),
            AddressDeployment {
                spec: spec.clone(),
                selector,
                checksum,
            },
        );
        self.update_gauge();
    }

    /// StatefulSet, ordinal and labels of the broker pod `pod`
    ///
    /// The controlling owner reference wins; pods without one are mapped
    /// through their cluster label.
    pub async fn get_statefulset_name_for_pod(&self, pod: &ObjectKey) -> Option<PodOwner> {
        let found = match self.store.get_pod(pod).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(pod = %pod, error = %e, "Failed to read pod");
                return None;
            }
        };

        let labels = found.labels().clone();
        let statefulset = found
            .owner_references()
            .iter()
            .find(|o| o.kind == "StatefulSet" && o.controller == Some(true))
            .map(|o| o.name.clone())
            .or_else(|| labels.get(CLUSTER_LABEL).map(|c| statefulset_name(c)))?;
        let ordinal = pod_ordinal(&pod.name, &statefulset)?;
        Some(PodOwner {
            statefulset,
            ordinal,
            labels,
        })
    }

    /// Handle an observed broker pod; returns the number of re-triggered
    /// deployments
    pub async fn on_pod_ready(&self, pod: &Pod) -> usize {
        if !is_pod_ready(pod) {
            return 0;
        }
        let Some(uid) = pod.uid() else {
            return 0;
        };
        let key = ObjectKey::of(pod);
        if self.ready_pods.get(&key).is_some_and(|seen| *seen == uid) {
            return 0;
        }
        self.ready_pods.insert(key.clone(), uid);

        let Some(owner) = self.get_statefulset_name_for_pod(&key).await else {
            debug!(pod = %key, "Pod not owned by a broker StatefulSet");
            return 0;
        };
        let cluster = cluster_name_for_statefulset(&owner.statefulset);

        let mut triggered = 0;
        for mut deployment in self.deployments.iter_mut() {
            let (address, d) = deployment.pair_mut();
            if address.namespace != key.namespace || !d.selector.applies_to(cluster) {
                continue;
            }
            d.checksum = None;
            let obj = ObjectRef::<BrokerAddress>::new(&address.name).within(&address.namespace);
            if self.trigger.send(obj).is_err() {
                warn!("Address forced-reconcile channel closed");
                break;
            }
            triggered += 1;
        }
        if triggered > 0 {
            info!(
                pod = %key,
                cluster = %cluster,
                ordinal = owner.ordinal,
                addresses = triggered,
                "Broker replica ready, re-applying addresses"
            );
        }
        triggered
    }
}

struct AddressContext {
    client: Client,
    controller: Arc<AddressController>,
    config: OperatorConfig,
    metrics: Option<ControllerMetrics>,
}

/// Start the BrokerAddress controller and its pod observer
pub async fn run_address_controller(
    client: Client,
    controller: Arc<AddressController>,
    triggers: UnboundedReceiver<ObjectRef<BrokerAddress>>,
) -> Result<()> {
    let config = controller.config.clone();
    let namespace = config.namespace.clone();
    let addresses: Api<BrokerAddress> = scoped_api(&client, namespace.as_deref());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting BrokerAddress controller"
    );

    let ctx = Arc::new(AddressContext {
        client: client.clone(),
        controller: controller.clone(),
        config,
        metrics: Some(ControllerMetrics::new("address")),
    });

    let reconciler = Controller::new(addresses, Config::default())
        .reconcile_on(UnboundedReceiverStream::new(triggers))
        .run(reconcile_address, address_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Address reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Address reconciliation failed");
                }
            }
        });

    let (_, observed) = tokio::join!(
        reconciler,
        observe_pods(client, namespace.as_deref(), controller)
    );
    observed
}

/// Feed broker pod changes into [`AddressController::on_pod_ready`]
async fn observe_pods(
    client: Client,
    namespace: Option<&str>,
    controller: Arc<AddressController>,
) -> Result<()> {
    let pods: Api<Pod> = scoped_api(&client, namespace);
    let mut stream = watcher::watcher(pods, Config::default().labels(CLUSTER_LABEL))
        .default_backoff()
        .applied_objects()
        .boxed();

    loop {
        match stream.try_next().await {
            Ok(Some(pod)) => {
                controller.on_pod_ready(&pod).await;
            }
            Ok(None) => return Ok(()),
            Err(e) => warn!(error = %e, "Pod watch error"),
        }
    }
}

async fn reconcile_address(address: Arc<BrokerAddress>, ctx: Arc<AddressContext>) -> Result<Action> {
    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = address.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<BrokerAddress> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, ADDRESS_FINALIZER, address, |event| async {
        match event {
            FinalizerEvent::Apply(address) => ctx.controller.apply(&address).await,
            FinalizerEvent::Cleanup(address) => ctx.controller.cleanup(&address).await,
        }
    })
    .await
    .map_err(OperatorError::from);

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.errors.increment(1);
        }
    }
    result
}

fn address_error_policy(
    address: Arc<BrokerAddress>,
    error: &OperatorError,
    ctx: Arc<AddressContext>,
) -> Action {
    match error.requeue_delay(ctx.config.resync_period) {
        Some(delay) => {
            warn!(
                name = %address.name_any(),
                error = %error,
                kind = error.kind(),
                "Address reconciliation error, requeueing"
            );
            Action::requeue(delay)
        }
        None => {
            error!(
                name = %address.name_any(),
                error = %error,
                kind = error.kind(),
                "Address reconciliation error, waiting for a change"
            );
            Action::await_change()
        }
    }
}
