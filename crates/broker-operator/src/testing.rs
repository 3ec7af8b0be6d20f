//! In-memory fixtures shared by the unit tests

use crate::crd::{BrokerCluster, BrokerClusterSpec, BrokerClusterStatus};
use crate::error::{OperatorError, Result};
use crate::naming::{self, ObjectKey};
use crate::store::KubeStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerStatus, EnvVar, Pod, PodCondition, PodSpec, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const NAMESPACE: &str = "test-ns";

#[derive(Default)]
struct Objects {
    clusters: BTreeMap<ObjectKey, BrokerCluster>,
    statefulsets: BTreeMap<ObjectKey, StatefulSet>,
    pods: BTreeMap<ObjectKey, Pod>,
    secrets: BTreeMap<ObjectKey, Secret>,
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
}

/// In-memory [`KubeStore`]
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<Objects>,
    resource_version: AtomicUsize,
    conflict_on_status: AtomicBool,
    pub status_patches: AtomicUsize,
    pub config_map_writes: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn add_cluster(&self, mut cluster: BrokerCluster) {
        cluster.metadata.resource_version = Some(self.next_version());
        let key = ObjectKey::of(&cluster);
        self.objects.lock().clusters.insert(key, cluster);
    }

    pub fn cluster(&self, key: &ObjectKey) -> Option<BrokerCluster> {
        self.objects.lock().clusters.get(key).cloned()
    }

    /// Add the StatefulSet of `cluster` with `ready` ready pods out of `replicas`
    pub fn add_broker(&self, cluster: &str, replicas: i32, ready: i32) {
        let names = naming::ClusterNames::for_name(cluster);
        let sts = StatefulSet {
            metadata: ObjectMeta {
                name: Some(names.statefulset.clone()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.objects
            .lock()
            .statefulsets
            .insert(ObjectKey::new(NAMESPACE, &names.statefulset), sts);

        for ordinal in 0..replicas {
            self.add_pod(test_pod(cluster, ordinal as u32, ordinal < ready));
        }
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = ObjectKey::of(&pod);
        self.objects.lock().pods.insert(key, pod);
    }

    pub fn remove_pod(&self, key: &ObjectKey) {
        self.objects.lock().pods.remove(key);
    }

    pub fn add_secret(&self, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                resource_version: Some(self.next_version()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.objects
            .lock()
            .secrets
            .insert(ObjectKey::new(NAMESPACE, name), secret);
    }

    pub fn add_config_map(&self, name: &str, data: &[(&str, &str)]) {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                resource_version: Some(self.next_version()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.objects
            .lock()
            .config_maps
            .insert(ObjectKey::new(NAMESPACE, name), cm);
    }

    pub fn config_maps(&self) -> Vec<ConfigMap> {
        self.objects.lock().config_maps.values().cloned().collect()
    }

    /// Make the next status patches fail with a 409
    pub fn fail_status_with_conflict(&self, conflict: bool) {
        self.conflict_on_status.store(conflict, Ordering::SeqCst);
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl KubeStore for FakeStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<BrokerCluster>> {
        Ok(self.cluster(key))
    }

    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<BrokerCluster>> {
        Ok(self
            .objects
            .lock()
            .clusters
            .iter()
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_statefulset(&self, key: &ObjectKey) -> Result<Option<StatefulSet>> {
        Ok(self.objects.lock().statefulsets.get(key).cloned())
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>> {
        Ok(self.objects.lock().pods.get(key).cloned())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .objects
            .lock()
            .pods
            .iter()
            .filter(|(k, p)| k.namespace == namespace && matches_selector(p.labels(), selector))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        Ok(self.objects.lock().secrets.get(key).cloned())
    }

    async fn get_config_map(&self, key: &ObjectKey) -> Result<Option<ConfigMap>> {
        Ok(self.objects.lock().config_maps.get(key).cloned())
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        Ok(self
            .objects
            .lock()
            .config_maps
            .iter()
            .filter(|(k, cm)| k.namespace == namespace && matches_selector(cm.labels(), selector))
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        self.config_map_writes.fetch_add(1, Ordering::SeqCst);
        let key = ObjectKey::new(namespace, config_map.name_any());
        let mut objects = self.objects.lock();
        if objects.config_maps.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut cm = config_map.clone();
        cm.metadata.namespace = Some(namespace.to_string());
        objects.config_maps.insert(key, cm);
        Ok(())
    }

    async fn delete_config_map(&self, key: &ObjectKey) -> Result<()> {
        self.config_map_writes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().config_maps.remove(key);
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &BrokerClusterStatus,
    ) -> Result<()> {
        self.status_patches.fetch_add(1, Ordering::SeqCst);
        if self.conflict_on_status.load(Ordering::SeqCst) {
            return Err(api_error(409, "Conflict"));
        }
        let next = self.next_version();
        let mut objects = self.objects.lock();
        let cluster = objects
            .clusters
            .get_mut(key)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if resource_version.is_some()
            && cluster.metadata.resource_version.as_deref() != resource_version
        {
            return Err(api_error(409, "Conflict"));
        }
        cluster.status = Some(status.clone());
        cluster.metadata.resource_version = Some(next);
        Ok(())
    }
}

fn api_error(code: u16, reason: &str) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// Cluster fixture in [`NAMESPACE`]
pub fn test_cluster(name: &str, spec: BrokerClusterSpec) -> BrokerCluster {
    BrokerCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{}-uid", name)),
            generation: Some(1),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Broker pod fixture for replica `ordinal` of `cluster`
pub fn test_pod(cluster: &str, ordinal: u32, ready: bool) -> Pod {
    let names = naming::ClusterNames::for_name(cluster);
    let status = if ready { "True" } else { "False" };
    Pod {
        metadata: ObjectMeta {
            name: Some(names.pod_name(ordinal)),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{}-{}-uid", cluster, ordinal)),
            labels: Some(names.labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: names.container.clone(),
                env: Some(vec![
                    EnvVar {
                        name: "BROKER_USER".to_string(),
                        value: Some("admin".to_string()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "BROKER_PASSWORD".to_string(),
                        value: Some("secret".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: status.to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(vec![ContainerStatus {
                name: names.container,
                ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}
