//! Security config handler registry
//!
//! Security controllers register handlers that contribute init-container
//! configuration to the clusters they apply to. Registering with
//! `force_reconcile`, or unregistering, re-triggers every applicable cluster
//! through the cluster controller's forced-reconcile channel.

use crate::crd::BrokerCluster;
use crate::error::Result;
use crate::naming::{ClusterKey, ObjectKey};
use crate::store::KubeStore;
use k8s_openapi::api::core::v1::Container;
use kube::runtime::reflector::ObjectRef;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sender side of the forced-reconcile channel
pub type ReconcileTrigger = UnboundedSender<ObjectRef<BrokerCluster>>;

/// Provider of security configuration for broker clusters
pub trait ConfigHandler: Send + Sync {
    fn is_applicable_for(&self, cluster: &ClusterKey) -> bool;

    /// Init-container arguments producing the configuration under
    /// `output_dir_root`
    fn config(
        &self,
        init_containers: &[Container],
        output_dir_root: &str,
        profile_version: &str,
        profile_name: &str,
    ) -> Vec<String>;
}

pub struct ConfigHandlerRegistry {
    handlers: Mutex<BTreeMap<ObjectKey, Arc<dyn ConfigHandler>>>,
    store: Arc<dyn KubeStore>,
    trigger: ReconcileTrigger,
}

impl ConfigHandlerRegistry {
    pub fn new(store: Arc<dyn KubeStore>, trigger: ReconcileTrigger) -> Self {
        Self {
            handlers: Mutex::new(BTreeMap::new()),
            store,
            trigger,
        }
    }

    /// Install or replace the handler owned by `owner`
    pub async fn register(
        &self,
        owner: ObjectKey,
        handler: Arc<dyn ConfigHandler>,
        force_reconcile: bool,
    ) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        info!(owner = %owner, force_reconcile, "Registering config handler");
        handlers.insert(owner, handler.clone());
        if force_reconcile {
            self.fan_out(handler.as_ref()).await?;
        }
        Ok(())
    }

    /// Remove the handler owned by `owner`, re-triggering the clusters it
    /// applied to
    pub async fn unregister(&self, owner: &ObjectKey) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        let Some(handler) = handlers.remove(owner) else {
            debug!(owner = %owner, "No config handler registered");
            return Ok(());
        };
        info!(owner = %owner, "Unregistered config handler");
        self.fan_out(handler.as_ref()).await?;
        Ok(())
    }

    /// First registered handler applicable to `cluster`
    pub async fn lookup(&self, cluster: &ClusterKey) -> Option<Arc<dyn ConfigHandler>> {
        self.handlers
            .lock()
            .await
            .values()
            .find(|h| h.is_applicable_for(cluster))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.handlers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.lock().await.is_empty()
    }

    // Runs under the handlers lock
    async fn fan_out(&self, handler: &dyn ConfigHandler) -> Result<usize> {
        let mut triggered = 0;
        for cluster in self.store.list_clusters(None).await? {
            let key = ObjectKey::of(&cluster);
            if !handler.is_applicable_for(&key) {
                continue;
            }
            if self.trigger.send(ObjectRef::from_obj(&cluster)).is_err() {
                warn!(cluster = %key, "Forced-reconcile channel closed");
                break;
            }
            debug!(cluster = %key, "Triggered forced reconcile");
            triggered += 1;
        }
        info!(clusters = triggered, "Forced reconcile fan-out complete");
        Ok(triggered)
    }
}
