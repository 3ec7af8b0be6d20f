//! Deterministic naming and addressing
//!
//! Every consumer (cluster controller, address synchronizer, status projection)
//! derives the names of the objects belonging to a `BrokerCluster` from the
//! cluster identity alone, so no live lookup is needed to find a replica.
//!
//! Names follow a `prefix-base-suffix` rule:
//!
//! | Object | Name |
//! |---|---|
//! | StatefulSet | `<cluster>-ss` |
//! | Headless service | `<cluster>-hdls-svc` |
//! | Ping service | `<cluster>-ping-svc` |
//! | Credentials secret | `<cluster>-credentials-secret` |
//! | Console TLS secret | `<cluster>-console-secret` (or `spec.console.sslSecret`) |
//! | Internal TLS secret | `<cluster>-netty-secret` |
//! | Management secret | `<cluster>-management-secret` |
//!
//! Replica `i` is reachable at
//! `<cluster>-ss-<i>.<cluster>-hdls-svc.<namespace>.svc.<cluster-domain>`.

use crate::crd::BrokerCluster;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;

/// Label carrying the owning cluster name on every broker pod
pub const CLUSTER_LABEL: &str = "broker.operator.dev/cluster";

/// Label used by the `application=<base>-<suffix>` selector convention
pub const APPLICATION_LABEL: &str = "application";

/// Default Kubernetes cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Reserved selector entry meaning "every cluster"
pub const WILDCARD: &str = "*";

const STATEFULSET_SUFFIX: &str = "ss";

/// Namespaced identity of a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a namespaced resource, falling back to `default`
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

/// Identity of one declared broker cluster
pub type ClusterKey = ObjectKey;

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Builds a name from optional prefix, a base and an optional suffix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameBuilder {
    prefix: Option<String>,
    base: Option<String>,
    suffix: Option<String>,
}

impl NameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Join the present parts with `-`
    pub fn build(&self) -> String {
        [&self.prefix, &self.base, &self.suffix]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// All names derived from one cluster identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    pub cluster: String,
    pub statefulset: String,
    pub headless_service: String,
    pub ping_service: String,
    pub container: String,
    pub credentials_secret: String,
    pub console_secret: String,
    pub netty_secret: String,
    pub management_secret: String,
    pub data_path: String,
}

impl ClusterNames {
    /// Names for a cluster that only exists as a name (e.g. an address target)
    pub fn for_name(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            statefulset: statefulset_name(cluster),
            headless_service: NameBuilder::new()
                .prefix(cluster)
                .base("hdls")
                .suffix("svc")
                .build(),
            ping_service: NameBuilder::new()
                .prefix(cluster)
                .base("ping")
                .suffix("svc")
                .build(),
            container: NameBuilder::new()
                .base(cluster)
                .suffix("container")
                .build(),
            credentials_secret: NameBuilder::new()
                .prefix(cluster)
                .base("credentials")
                .suffix("secret")
                .build(),
            console_secret: NameBuilder::new()
                .prefix(cluster)
                .base("console")
                .suffix("secret")
                .build(),
            netty_secret: NameBuilder::new()
                .prefix(cluster)
                .base("netty")
                .suffix("secret")
                .build(),
            management_secret: NameBuilder::new()
                .prefix(cluster)
                .base("management")
                .suffix("secret")
                .build(),
            data_path: format!("/opt/{}/data", cluster),
        }
    }

    /// Names for a declared cluster, honouring a user supplied console secret
    pub fn for_cluster(cluster: &BrokerCluster) -> Self {
        let mut names = Self::for_name(&cluster.name_any());
        if let Some(secret) = cluster
            .spec
            .console
            .ssl_secret
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            names.console_secret = secret.to_string();
        }
        names
    }

    /// Pod labels (also the StatefulSet selector)
    pub fn labels(&self) -> BTreeMap<String, String> {
        cluster_labels(&self.cluster)
    }

    /// Comma separated `k=v` form of [`ClusterNames::labels`]
    pub fn label_selector(&self) -> String {
        to_selector(&self.labels())
    }

    /// DNS name of replica `ordinal`
    pub fn replica_fqdn(&self, ordinal: u32, namespace: &str, cluster_domain: &str) -> String {
        format!(
            "{}-{}.{}.{}.svc.{}",
            self.statefulset, ordinal, self.headless_service, namespace, cluster_domain
        )
    }

    /// Pod name of replica `ordinal`
    pub fn pod_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.statefulset, ordinal)
    }
}

/// StatefulSet name for a cluster
pub fn statefulset_name(cluster: &str) -> String {
    NameBuilder::new()
        .base(cluster)
        .suffix(STATEFULSET_SUFFIX)
        .build()
}

/// Recover the cluster name from a StatefulSet name
pub fn cluster_name_for_statefulset(statefulset: &str) -> &str {
    statefulset
        .strip_suffix(STATEFULSET_SUFFIX)
        .and_then(|s| s.strip_suffix('-'))
        .unwrap_or(statefulset)
}

/// Fully-qualified domain name of replica `ordinal` of `cluster`
pub fn replica_fqdn(cluster: &str, ordinal: u32, namespace: &str, cluster_domain: &str) -> String {
    ClusterNames::for_name(cluster).replica_fqdn(ordinal, namespace, cluster_domain)
}

/// Ordinal of `pod_name` if it belongs to `statefulset`
pub fn pod_ordinal(pod_name: &str, statefulset: &str) -> Option<u32> {
    pod_name
        .strip_prefix(statefulset)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Labels selecting the pods of a cluster
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            APPLICATION_LABEL.to_string(),
            NameBuilder::new().base(cluster).suffix("app").build(),
        ),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
    ])
}

/// Labels identifying the side artifacts of an address declaration
pub fn address_labels(address: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        APPLICATION_LABEL.to_string(),
        NameBuilder::new().base(address).suffix("addr").build(),
    )])
}

/// Render labels as a label selector string
pub fn to_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Which clusters an address declaration applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Every known cluster
    All,
    /// Only the listed clusters
    Named(Vec<String>),
}

impl TargetSelector {
    /// Build from a declared list; empty, `""` or `"*"` mean every cluster
    pub fn from_names(names: &[String]) -> Self {
        if names.is_empty() || names.iter().any(|n| n.is_empty() || n == WILDCARD) {
            Self::All
        } else {
            Self::Named(names.to_vec())
        }
    }

    pub fn applies_to(&self, cluster: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.iter().any(|n| n == cluster),
        }
    }
}
