//! Replica target resolution
//!
//! A target is one broker replica addressed by its stable DNS name. Targets are
//! rebuilt on every invocation because replica counts and credentials can
//! change between reconciliations.

use crate::error::Result;
use crate::naming::{ClusterKey, ClusterNames, ObjectKey, TargetSelector};
use crate::store::{secret_value, KubeStore};
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::ResourceExt;
use std::fmt;
use tracing::{debug, warn};

/// Secret key holding a user-defined management user
pub const MANAGEMENT_USER_KEY: &str = "managementUser";

/// Secret key holding a user-defined management password
pub const MANAGEMENT_PASSWORD_KEY: &str = "managementPassword";

const USER_ENV: &str = "BROKER_USER";
const PASSWORD_ENV: &str = "BROKER_PASSWORD";
const CONSOLE_ARGS_ENV: &str = "BROKER_CONSOLE_ARGS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Management credentials for one replica
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub protocol: Protocol,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// One broker replica reachable through its management endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub cluster: ClusterKey,
    pub ordinal: u32,
    pub fqdn: String,
    pub credentials: Credentials,
}

/// A replica that exists in the plan but cannot be addressed right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableReplica {
    pub fqdn: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ResolvedTargets {
    pub targets: Vec<ReplicaTarget>,
    pub unavailable: Vec<UnavailableReplica>,
}

impl ResolvedTargets {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.unavailable.is_empty()
    }
}

/// Resolves declared cluster names into replica targets
pub struct TargetResolver<'a> {
    store: &'a dyn KubeStore,
    cluster_domain: &'a str,
}

impl<'a> TargetResolver<'a> {
    pub fn new(store: &'a dyn KubeStore, cluster_domain: &'a str) -> Self {
        Self {
            store,
            cluster_domain,
        }
    }

    /// Cluster identities selected in `namespace`
    pub async fn clusters(
        &self,
        namespace: &str,
        selector: &TargetSelector,
    ) -> Result<Vec<ClusterKey>> {
        match selector {
            TargetSelector::All => Ok(self
                .store
                .list_clusters(Some(namespace))
                .await?
                .iter()
                .map(ObjectKey::of)
                .collect()),
            TargetSelector::Named(names) => Ok(names
                .iter()
                .map(|n| ObjectKey::new(namespace, n))
                .collect()),
        }
    }

    /// Every replica target of the selected clusters
    ///
    /// A cluster without a StatefulSet has nothing deployed yet and is skipped.
    /// A replica whose pod is missing is reported as unavailable.
    pub async fn resolve(&self, namespace: &str, selector: &TargetSelector) -> Result<ResolvedTargets> {
        let mut resolved = ResolvedTargets::default();
        for cluster in self.clusters(namespace, selector).await? {
            self.resolve_cluster(&cluster, &mut resolved).await?;
        }
        debug!(
            namespace = %namespace,
            targets = resolved.targets.len(),
            unavailable = resolved.unavailable.len(),
            "Resolved replica targets"
        );
        Ok(resolved)
    }

    async fn resolve_cluster(&self, cluster: &ClusterKey, out: &mut ResolvedTargets) -> Result<()> {
        let names = ClusterNames::for_name(&cluster.name);
        let sts_key = ObjectKey::new(&cluster.namespace, &names.statefulset);
        let Some(sts) = self.store.get_statefulset(&sts_key).await? else {
            debug!(cluster = %cluster, "No StatefulSet deployed for cluster");
            return Ok(());
        };
        let replicas = sts
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0)
            .max(0) as u32;

        for ordinal in 0..replicas {
            let fqdn = names.replica_fqdn(ordinal, &cluster.namespace, self.cluster_domain);
            let pod_key = ObjectKey::new(&cluster.namespace, names.pod_name(ordinal));
            match self.store.get_pod(&pod_key).await? {
                Some(pod) => {
                    let credentials = self.credentials(cluster, &names, &pod).await?;
                    out.targets.push(ReplicaTarget {
                        cluster: cluster.clone(),
                        ordinal,
                        fqdn,
                        credentials,
                    });
                }
                None => {
                    warn!(pod = %pod_key, "Broker pod not found");
                    out.unavailable.push(UnavailableReplica {
                        fqdn,
                        reason: format!("pod {} not found", pod_key.name),
                    });
                }
            }
        }
        Ok(())
    }

    /// Management secret first, then the broker container environment
    async fn credentials(
        &self,
        cluster: &ClusterKey,
        names: &ClusterNames,
        pod: &Pod,
    ) -> Result<Credentials> {
        let mut credentials = Credentials::default();
        let mut user_defined = false;

        let secret_key = ObjectKey::new(&cluster.namespace, &names.management_secret);
        if let Some(secret) = self.store.get_secret(&secret_key).await? {
            if let Some(user) = secret_value(&secret, MANAGEMENT_USER_KEY) {
                user_defined = true;
                credentials.user = user;
                credentials.password =
                    secret_value(&secret, MANAGEMENT_PASSWORD_KEY).unwrap_or_default();
            }
        }

        let env = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.env.as_deref())
            .unwrap_or_default();

        for var in env {
            match var.name.as_str() {
                USER_ENV if !user_defined => {
                    credentials.user = self.env_value(&cluster.namespace, var).await?;
                }
                PASSWORD_ENV if !user_defined => {
                    credentials.password = self.env_value(&cluster.namespace, var).await?;
                }
                CONSOLE_ARGS_ENV => {
                    if !self.env_value(&cluster.namespace, var).await?.is_empty() {
                        credentials.protocol = Protocol::Https;
                    }
                }
                _ => {}
            }
        }

        debug!(pod = %pod.name_any(), user_defined, "Resolved management credentials");
        Ok(credentials)
    }

    async fn env_value(&self, namespace: &str, var: &EnvVar) -> Result<String> {
        if let Some(value) = var.value.as_deref().filter(|v| !v.is_empty()) {
            return Ok(value.to_string());
        }
        let Some(secret_ref) = var
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
        else {
            return Ok(String::new());
        };
        let key = ObjectKey::new(namespace, &secret_ref.name);
        Ok(self
            .store
            .get_secret(&key)
            .await?
            .and_then(|s| secret_value(&s, &secret_ref.key))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BrokerClusterSpec;
    use crate::testing::{test_cluster, test_pod, FakeStore, NAMESPACE};
    use k8s_openapi::api::core::v1::{EnvVarSource, SecretKeySelector};

    const DOMAIN: &str = "cluster.local";

    #[tokio::test]
    async fn test_resolve_named_cluster() {
        let store = FakeStore::new();
        store.add_broker("broker", 2, 2);

        let resolver = TargetResolver::new(&store, DOMAIN);
        let selector = TargetSelector::Named(vec!["broker".to_string()]);
        let resolved = resolver.resolve(NAMESPACE, &selector).await.unwrap();

        assert_eq!(resolved.targets.len(), 2);
        assert!(resolved.unavailable.is_empty());
        assert_eq!(
            resolved.targets[1].fqdn,
            "broker-ss-1.broker-hdls-svc.test-ns.svc.cluster.local"
        );
        assert_eq!(resolved.targets[0].credentials.user, "admin");
        assert_eq!(resolved.targets[0].credentials.password, "secret");
        assert_eq!(resolved.targets[0].credentials.protocol, Protocol::Http);
    }

    #[tokio::test]
    async fn test_resolve_all_uses_every_cluster_in_namespace() {
        let store = FakeStore::new();
        store.add_cluster(test_cluster("a", BrokerClusterSpec::default()));
        store.add_cluster(test_cluster("b", BrokerClusterSpec::default()));
        store.add_broker("a", 1, 1);
        store.add_broker("b", 2, 2);

        let resolver = TargetResolver::new(&store, DOMAIN);
        let resolved = resolver
            .resolve(NAMESPACE, &TargetSelector::All)
            .await
            .unwrap();
        assert_eq!(resolved.targets.len(), 3);

        let other_ns = resolver
            .resolve("elsewhere", &TargetSelector::All)
            .await
            .unwrap();
        assert!(other_ns.is_empty());
    }

    #[tokio::test]
    async fn test_missing_statefulset_is_skipped() {
        let store = FakeStore::new();
        let resolver = TargetResolver::new(&store, DOMAIN);
        let resolved = resolver
            .resolve(NAMESPACE, &TargetSelector::Named(vec!["ghost".to_string()]))
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn test_missing_pod_is_unavailable() {
        let store = FakeStore::new();
        store.add_broker("broker", 2, 2);
        store.remove_pod(&ObjectKey::new(NAMESPACE, "broker-ss-1"));

        let resolver = TargetResolver::new(&store, DOMAIN);
        let resolved = resolver
            .resolve(NAMESPACE, &TargetSelector::Named(vec!["broker".to_string()]))
            .await
            .unwrap();
        assert_eq!(resolved.targets.len(), 1);
        assert_eq!(resolved.unavailable.len(), 1);
        assert!(resolved.unavailable[0].reason.contains("broker-ss-1"));
    }

    #[tokio::test]
    async fn test_management_secret_overrides_env() {
        let store = FakeStore::new();
        store.add_broker("broker", 1, 1);
        store.add_secret(
            "broker-management-secret",
            &[(MANAGEMENT_USER_KEY, "ops"), (MANAGEMENT_PASSWORD_KEY, "pw")],
        );

        let resolver = TargetResolver::new(&store, DOMAIN);
        let resolved = resolver
            .resolve(NAMESPACE, &TargetSelector::Named(vec!["broker".to_string()]))
            .await
            .unwrap();
        assert_eq!(resolved.targets[0].credentials.user, "ops");
        assert_eq!(resolved.targets[0].credentials.password, "pw");
    }

    #[tokio::test]
    async fn test_env_from_secret_and_https() {
        let store = FakeStore::new();
        store.add_broker("broker", 1, 1);
        store.add_secret("broker-credentials-secret", &[("password", "from-secret")]);

        let mut pod = test_pod("broker", 0, true);
        let container = &mut pod.spec.as_mut().unwrap().containers[0];
        container.env = Some(vec![
            EnvVar {
                name: USER_ENV.to_string(),
                value: Some("admin".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: PASSWORD_ENV.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: "broker-credentials-secret".to_string(),
                        key: "password".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: CONSOLE_ARGS_ENV.to_string(),
                value: Some("--ssl-key /etc/keystore".to_string()),
                ..Default::default()
            },
        ]);
        store.add_pod(pod);

        let resolver = TargetResolver::new(&store, DOMAIN);
        let resolved = resolver
            .resolve(NAMESPACE, &TargetSelector::Named(vec!["broker".to_string()]))
            .await
            .unwrap();
        let credentials = &resolved.targets[0].credentials;
        assert_eq!(credentials.password, "from-secret");
        assert_eq!(credentials.protocol, Protocol::Https);
        assert!(!format!("{:?}", credentials).contains("from-secret"));
    }
}
