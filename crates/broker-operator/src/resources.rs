//! Kubernetes Resource Builders
//!
//! This module generates the StatefulSet, discovery services and
//! PodDisruptionBudget of a BrokerCluster, and applies them through the
//! [`Provisioner`] seam.

use crate::config_handler::ConfigHandler;
use crate::crd::{BrokerCluster, API_GROUP, MANAGED_BY};
use crate::error::{OperatorError, Result};
use crate::naming::ClusterNames;
use crate::status::version_status;
use crate::store::FIELD_MANAGER;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, PodSpec,
    PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

/// Label naming the controller that owns a resource
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Port of the broker acceptor
pub const ACCEPTOR_PORT: i32 = 61616;

/// Port of the console and management endpoint
pub const CONSOLE_PORT: i32 = 8161;

/// Port used for peer discovery
pub const PING_PORT: i32 = 8888;

/// Where the init container writes the generated broker configuration
pub const INIT_OUTPUT_DIR: &str = "/amq/init/config";

/// Profile handed to config handlers
pub const INIT_PROFILE: &str = "default";

const EXTRA_CONFIG_MAPS_DIR: &str = "/amq/extra/configmaps";
const EXTRA_SECRETS_DIR: &str = "/amq/extra/secrets";
const INIT_VOLUME: &str = "amq-cfg-dir";
const USER_KEY: &str = "BROKER_USER";
const PASSWORD_KEY: &str = "BROKER_PASSWORD";
const CONSOLE_ARGS_ENV: &str = "BROKER_CONSOLE_ARGS";
const DATA_DIR_ENV: &str = "BROKER_DATA_DIR";

/// Builder for generating Kubernetes resources from a BrokerCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a BrokerCluster,
    names: ClusterNames,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(cluster: &'a BrokerCluster) -> Result<Self> {
        if cluster.metadata.name.is_none() {
            return Err(OperatorError::InvalidConfig(
                "cluster name is required".to_string(),
            ));
        }
        let namespace = cluster
            .namespace()
            .ok_or_else(|| OperatorError::InvalidConfig("cluster namespace is required".into()))?;

        Ok(Self {
            cluster,
            names: ClusterNames::for_cluster(cluster),
            namespace,
        })
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{}/v1beta1", API_GROUP),
            kind: "BrokerCluster".to_string(),
            name: self.names.cluster.clone(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        let mut labels = self.names.labels();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the StatefulSet running the broker replicas
    ///
    /// The init container arguments come from `handler` when one applies.
    pub fn build_statefulset(&self, handler: Option<&dyn ConfigHandler>) -> StatefulSet {
        let selector_labels = self.names.labels();
        let (volumes, extra_mounts) = self.extra_volumes();
        let version = version_status(self.cluster);

        let mut init = Container {
            name: format!("{}-init", self.names.container),
            image: Some(version.init_image.clone()),
            args: Some(vec!["--output".to_string(), INIT_OUTPUT_DIR.to_string()]),
            volume_mounts: Some(vec![VolumeMount {
                name: INIT_VOLUME.to_string(),
                mount_path: INIT_OUTPUT_DIR.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        if let Some(handler) = handler {
            let args = handler.config(
                std::slice::from_ref(&init),
                INIT_OUTPUT_DIR,
                &version.broker_version,
                INIT_PROFILE,
            );
            init.args = Some(args);
        }

        let mut mounts = vec![VolumeMount {
            name: INIT_VOLUME.to_string(),
            mount_path: INIT_OUTPUT_DIR.to_string(),
            ..Default::default()
        }];
        mounts.extend(extra_mounts);

        let mut all_volumes = vec![Volume {
            name: INIT_VOLUME.to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }];
        all_volumes.extend(volumes);

        let mut env = vec![
            self.credential_env(USER_KEY),
            self.credential_env(PASSWORD_KEY),
            EnvVar {
                name: DATA_DIR_ENV.to_string(),
                value: Some(self.names.data_path.clone()),
                ..Default::default()
            },
        ];

        if self.cluster.spec.console.ssl_enabled {
            let volume = format!("{}-volume", self.names.console_secret);
            let path = format!("/etc/{}", volume);
            env.push(EnvVar {
                name: CONSOLE_ARGS_ENV.to_string(),
                value: Some(format!(
                    "--ssl-key {path}/broker.ks --ssl-trust {path}/client.ts"
                )),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume.clone(),
                mount_path: path,
                read_only: Some(true),
                ..Default::default()
            });
            all_volumes.push(Volume {
                name: volume,
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.names.console_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let container = Container {
            name: self.names.container.clone(),
            image: Some(version.image),
            env: Some(env),
            ports: Some(vec![
                ContainerPort {
                    name: Some("all".to_string()),
                    container_port: ACCEPTOR_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("console".to_string()),
                    container_port: CONSOLE_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(ACCEPTOR_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..Default::default()
            }),
            volume_mounts: Some(mounts),
            ..Default::default()
        };

        StatefulSet {
            metadata: self.metadata(&self.names.statefulset),
            spec: Some(StatefulSetSpec {
                service_name: self.names.headless_service.clone(),
                replicas: Some(self.cluster.spec.deployment_plan.size),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers: Some(vec![init]),
                        containers: vec![container],
                        volumes: Some(all_volumes),
                        ..Default::default()
                    }),
                },
                pod_management_policy: Some("OrderedReady".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn credential_env(&self, key: &str) -> EnvVar {
        EnvVar {
            name: key.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: self.names.credentials_secret.clone(),
                    key: key.to_string(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn extra_volumes(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        let mounts = &self.cluster.spec.deployment_plan.extra_mounts;
        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();

        for name in &mounts.config_maps {
            let volume = format!("{}-volume", name);
            volumes.push(Volume {
                name: volume.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: volume,
                mount_path: format!("{}/{}", EXTRA_CONFIG_MAPS_DIR, name),
                read_only: Some(true),
                ..Default::default()
            });
        }
        for name in &mounts.secrets {
            let volume = format!("{}-volume", name);
            volumes.push(Volume {
                name: volume.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: volume,
                mount_path: format!("{}/{}", EXTRA_SECRETS_DIR, name),
                read_only: Some(true),
                ..Default::default()
            });
        }
        (volumes, volume_mounts)
    }

    /// Build the headless service giving every replica a stable DNS name
    pub fn build_headless_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.headless_service),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.names.labels()),
                ports: Some(vec![
                    service_port("all", ACCEPTOR_PORT),
                    service_port("console", CONSOLE_PORT),
                ]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the service used for peer discovery
    pub fn build_ping_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.ping_service),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.names.labels()),
                ports: Some(vec![service_port("ping", PING_PORT)]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the PodDisruptionBudget, if one is declared
    ///
    /// The selector is always derived from the cluster's pod labels.
    pub fn build_pdb(&self) -> Option<PodDisruptionBudget> {
        let declared = self
            .cluster
            .spec
            .deployment_plan
            .pod_disruption_budget
            .as_ref()?;

        Some(PodDisruptionBudget {
            metadata: self.metadata(&format!("{}-pdb", self.names.cluster)),
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(self.names.labels()),
                    ..Default::default()
                }),
                min_available: declared.min_available.as_deref().map(int_or_string),
                max_unavailable: declared.max_unavailable.as_deref().map(int_or_string),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn int_or_string(value: &str) -> IntOrString {
    value
        .parse::<i32>()
        .map(IntOrString::Int)
        .unwrap_or_else(|_| IntOrString::String(value.to_string()))
}

/// Creates or updates the workload objects of a cluster
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        cluster: &BrokerCluster,
        handler: Option<&dyn ConfigHandler>,
    ) -> Result<()>;
}

/// [`Provisioner`] using server-side apply
#[derive(Clone)]
pub struct KubeProvisioner {
    client: Client,
}

impl KubeProvisioner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Apply an object using server-side apply.
    ///
    /// Uses `PatchParams::apply(..).force()`, which takes ownership of every
    /// field in the patch. The operator must own the existing object through
    /// the `app.kubernetes.io/managed-by` label.
    async fn apply<K>(&self, namespace: &str, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = obj.meta().name.as_deref().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} missing metadata.name", K::kind(&())))
        })?;

        debug!(kind = %K::kind(&()), name = %name, "Applying resource");

        if let Some(existing) = api.get_opt(name).await? {
            verify_ownership(&existing)?;
        }

        let patch_params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &patch_params, &Patch::Apply(obj)).await?;
        Ok(())
    }
}

#[async_trait]
impl Provisioner for KubeProvisioner {
    async fn provision(
        &self,
        cluster: &BrokerCluster,
        handler: Option<&dyn ConfigHandler>,
    ) -> Result<()> {
        let builder = ResourceBuilder::new(cluster)?;
        let namespace = builder.namespace.clone();

        self.apply(&namespace, &builder.build_headless_service())
            .await?;
        self.apply(&namespace, &builder.build_ping_service()).await?;
        self.apply(&namespace, &builder.build_statefulset(handler))
            .await?;
        if let Some(pdb) = builder.build_pdb() {
            self.apply(&namespace, &pdb).await?;
        }

        info!(name = %cluster.name_any(), namespace = %namespace, "Provisioned broker cluster");
        Ok(())
    }
}

/// Refuse to force-apply over a resource managed by another controller
pub fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    match labels.and_then(|l| l.get(MANAGED_BY_LABEL)) {
        Some(manager) if manager != MANAGED_BY => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, MANAGED_BY
            )))
        }
        _ => Ok(()),
    }
}
