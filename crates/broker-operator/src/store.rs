//! Object store seam
//!
//! The reconcilers only talk to the API server through [`KubeStore`], which
//! keeps them testable against an in-memory store.

use crate::crd::{BrokerCluster, BrokerClusterStatus};
use crate::error::{OperatorError, Result};
use crate::naming::ObjectKey;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "broker-operator";

/// CRUD access to the objects the operator reads and writes
#[async_trait]
pub trait KubeStore: Send + Sync {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<BrokerCluster>>;

    /// List clusters in `namespace`, or everywhere when `None`
    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<BrokerCluster>>;

    async fn get_statefulset(&self, key: &ObjectKey) -> Result<Option<StatefulSet>>;

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>>;

    async fn get_config_map(&self, key: &ObjectKey) -> Result<Option<ConfigMap>>;

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Delete a config map; a missing object is not an error
    async fn delete_config_map(&self, key: &ObjectKey) -> Result<()>;

    /// Merge-patch the status, guarded by `resource_version` when given
    async fn patch_cluster_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &BrokerClusterStatus,
    ) -> Result<()>;
}

/// [`KubeStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeApiStore {
    client: Client,
}

impl KubeApiStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeStore for KubeApiStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<BrokerCluster>> {
        Ok(self
            .namespaced::<BrokerCluster>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<BrokerCluster>> {
        let api: Api<BrokerCluster> = match namespace {
            Some(ns) => self.namespaced(ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_statefulset(&self, key: &ObjectKey) -> Result<Option<StatefulSet>> {
        Ok(self
            .namespaced::<StatefulSet>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>> {
        Ok(self
            .namespaced::<Pod>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(selector);
        Ok(self.namespaced::<Pod>(namespace).list(&lp).await?.items)
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        Ok(self
            .namespaced::<Secret>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn get_config_map(&self, key: &ObjectKey) -> Result<Option<ConfigMap>> {
        Ok(self
            .namespaced::<ConfigMap>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        let lp = ListParams::default().labels(selector);
        Ok(self.namespaced::<ConfigMap>(namespace).list(&lp).await?.items)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.namespaced::<ConfigMap>(namespace)
            .create(&pp, config_map)
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, key: &ObjectKey) -> Result<()> {
        match self
            .namespaced::<ConfigMap>(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_cluster_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &BrokerClusterStatus,
    ) -> Result<()> {
        debug!(cluster = %key, "Patching cluster status");

        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.namespaced::<BrokerCluster>(&key.namespace)
            .patch_status(&key.name, &pp, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Decoded value of `key` in a secret, looking at `data` then `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key).cloned()))
}

/// Whether a secret carries `key`
pub fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
        || secret
            .string_data
            .as_ref()
            .is_some_and(|d| d.contains_key(key))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Whether an error is an optimistic-concurrency conflict
pub fn is_conflict(err: &OperatorError) -> bool {
    matches!(err, OperatorError::KubeError(kube::Error::Api(resp)) if resp.code == 409)
}
