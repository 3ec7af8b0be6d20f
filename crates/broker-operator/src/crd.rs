//! Custom Resource Definitions for the broker operator
//!
//! `BrokerCluster` declares a multi-replica broker deployment and
//! `BrokerAddress` declares an address (and optionally a queue) that must exist
//! on every replica of the clusters it targets.

use chrono::Utc;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group shared by all operator resources
pub const API_GROUP: &str = "broker.operator.dev";

/// Value of `app.kubernetes.io/managed-by` on owned resources
pub const MANAGED_BY: &str = "broker-operator";

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Integer or percentage (e.g. "1" or "25%")
static INT_OR_PERCENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+|[0-9]+%)$").unwrap());

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

fn validate_mount_names(names: &[String]) -> Result<(), ValidationError> {
    names.iter().try_for_each(|n| validate_k8s_name(n))
}

fn validate_int_or_percent(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || INT_OR_PERCENT_REGEX.is_match(value) {
        return Ok(());
    }
    Err(ValidationError::new("invalid_int_or_percent").with_message(
        format!(
            "'{}' must be an integer or percentage (e.g., '1' or '25%')",
            value
        )
        .into(),
    ))
}

fn validate_routing_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "ANYCAST" | "MULTICAST" => Ok(()),
        other => Err(ValidationError::new("invalid_routing_type").with_message(
            format!("routing type must be ANYCAST or MULTICAST, got '{}'", other).into(),
        )),
    }
}

/// Validate each entry of `applyToClusterNames` (wildcard allowed)
fn validate_target_names(names: &[String]) -> Result<(), ValidationError> {
    names
        .iter()
        .filter(|n| !n.is_empty() && n.as_str() != crate::naming::WILDCARD)
        .try_for_each(|n| validate_k8s_name(n))
}

/// BrokerCluster custom resource definition
///
/// Represents a multi-replica broker deployment. The operator validates the
/// declaration, provisions the StatefulSet and services, and projects replica
/// readiness into the status.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "broker.operator.dev",
    version = "v1beta1",
    kind = "BrokerCluster",
    plural = "brokerclusters",
    shortname = "bc",
    namespaced,
    status = "BrokerClusterStatus",
    scale = r#"{"specReplicasPath":".spec.deploymentPlan.size","statusReplicasPath":".status.deploymentPlanSize","labelSelectorPath":".status.scaleLabelSelector"}"#,
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.deploymentPlan.size"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version.brokerVersion"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerClusterSpec {
    /// Broker version to deploy; a `major` or `major.minor` prefix resolves to
    /// the newest supported patch release
    #[serde(default)]
    #[validate(length(max = 64, message = "version must be at most 64 characters"))]
    pub version: Option<String>,

    /// Replica set shape and images
    #[serde(default)]
    #[validate(nested)]
    pub deployment_plan: DeploymentPlan,

    /// Management console settings
    #[serde(default)]
    pub console: ConsoleSpec,
}

/// Deployment plan for the broker replicas
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    /// Number of broker replicas (0-100)
    #[serde(default = "default_size")]
    #[validate(range(min = 0, max = 100, message = "size must be between 0 and 100"))]
    pub size: i32,

    /// Broker image; pinning it requires pinning `initImage` too
    #[serde(default)]
    pub image: Option<String>,

    /// Init image; pinning it requires pinning `image` too
    #[serde(default)]
    pub init_image: Option<String>,

    /// Config maps and secrets mounted into every broker pod
    #[serde(default)]
    #[validate(nested)]
    pub extra_mounts: ExtraMounts,

    /// Pod disruption budget for the broker pods
    #[serde(default)]
    #[validate(nested)]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,
}

impl Default for DeploymentPlan {
    fn default() -> Self {
        Self {
            size: default_size(),
            image: None,
            init_image: None,
            extra_mounts: ExtraMounts::default(),
            pod_disruption_budget: None,
        }
    }
}

fn default_size() -> i32 {
    1
}

/// Extra config maps/secrets mounted under `/amq/extra`
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraMounts {
    #[serde(default)]
    #[validate(custom(function = "validate_mount_names"))]
    pub config_maps: Vec<String>,

    #[serde(default)]
    #[validate(custom(function = "validate_mount_names"))]
    pub secrets: Vec<String>,
}

impl ExtraMounts {
    pub fn is_empty(&self) -> bool {
        self.config_maps.is_empty() && self.secrets.is_empty()
    }
}

/// Pod disruption budget; the operator derives the selector itself
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpec {
    #[serde(default)]
    #[validate(custom(function = "validate_int_or_percent"))]
    pub min_available: Option<String>,

    #[serde(default)]
    #[validate(custom(function = "validate_int_or_percent"))]
    pub max_unavailable: Option<String>,

    /// Must stay unset; declaring one fails validation
    #[serde(default)]
    pub selector: Option<PodSelector>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Management console configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleSpec {
    /// Expose the console outside the cluster
    #[serde(default)]
    pub expose: bool,

    /// Serve the console (and management API) over TLS
    #[serde(default)]
    pub ssl_enabled: bool,

    /// Secret holding the console keystore; defaults to `<cluster>-console-secret`
    #[serde(default)]
    pub ssl_secret: Option<String>,
}

/// Status of a BrokerCluster resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerClusterStatus {
    /// Replica count of the last processed spec
    #[serde(default)]
    pub deployment_plan_size: i32,

    /// Selector used by the scale subresource
    #[serde(default)]
    pub scale_label_selector: String,

    /// Resolved version and images
    #[serde(default)]
    pub version: VersionStatus,

    /// Resource versions of mounted config maps/secrets
    #[serde(default)]
    pub external_configs: Vec<ExternalConfigStatus>,

    /// Pod names by readiness
    #[serde(default)]
    pub pod_status: PodStatusSummary,

    /// Conditions describing cluster state
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionStatus {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub init_image: String,
    #[serde(default)]
    pub broker_version: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalConfigStatus {
    pub name: String,
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusSummary {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub starting: Vec<String>,
    #[serde(default)]
    pub stopped: Vec<String>,
}

pub mod condition_types {
    pub const VALID: &str = "Valid";
    pub const DEPLOYED: &str = "Deployed";
    pub const READY: &str = "Ready";
}

pub mod condition_reasons {
    pub const VALIDATION: &str = "ValidationSucceeded";
    pub const SPEC_INVALID: &str = "SpecInvalid";
    pub const MISSING_RESOURCES: &str = "MissingResources";
    pub const INVALID_EXTRA_MOUNT: &str = "InvalidExtraMount";
    pub const DUPLICATE_EXTRA_MOUNT: &str = "DuplicateExtraMount";
    pub const PDB_NON_NIL_SELECTOR: &str = "PDBNonNilSelector";
    pub const INVALID_CONSOLE_SECRET: &str = "InvalidConsoleSecret";
    pub const SPEC_VERSION_INVALID: &str = "SpecVersionInvalid";
    pub const IMAGE_VERSION_CONFLICT: &str = "ImageVersionConflict";
    pub const IMAGE_DEPENDENT_PAIR: &str = "ImageDependentPair";
    pub const ALL_PODS_READY: &str = "AllPodsReady";
    pub const PODS_NOT_READY: &str = "PodsNotReady";
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    pub const READY: &str = "Ready";
    pub const NOT_READY: &str = "NotReady";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Valid, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Generation of the spec this condition was computed from
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: 0,
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Structural equality on type, status, reason and message
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Install `condition`, replacing any condition of the same type
///
/// The transition time of the existing entry is kept while its status does
/// not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.take();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// BrokerAddress custom resource definition
///
/// Declares an address, and optionally a queue bound to it, that the operator
/// creates on every replica of the targeted clusters.
///
/// ```yaml
/// apiVersion: broker.operator.dev/v1beta1
/// kind: BrokerAddress
/// metadata:
///   name: orders
/// spec:
///   addressName: orders
///   queueName: orders.q
///   routingType: ANYCAST
///   applyToClusterNames: ["*"]
///   removeFromBrokerOnDelete: true
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "broker.operator.dev",
    version = "v1beta1",
    kind = "BrokerAddress",
    plural = "brokeraddresses",
    shortname = "ba",
    namespaced,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.addressName"}"#,
    printcolumn = r#"{"name":"Queue","type":"string","jsonPath":".spec.queueName"}"#,
    printcolumn = r#"{"name":"Routing","type":"string","jsonPath":".spec.routingType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAddressSpec {
    /// Address name on the broker
    #[validate(length(min = 1, max = 255, message = "address name must be 1-255 characters"))]
    pub address_name: String,

    /// Queue to create on the address
    #[serde(default)]
    pub queue_name: Option<String>,

    /// ANYCAST or MULTICAST
    #[serde(default)]
    #[validate(custom(function = "validate_routing_type"))]
    pub routing_type: Option<String>,

    /// Remove the address/queue from the brokers when this resource is deleted
    #[serde(default)]
    pub remove_from_broker_on_delete: bool,

    /// Target clusters; empty or `"*"` means every cluster in the namespace
    #[serde(default)]
    #[validate(custom(function = "validate_target_names"))]
    pub apply_to_cluster_names: Vec<String>,

    /// Queue settings; defaults are applied when absent
    #[serde(default)]
    #[validate(nested)]
    pub queue_configuration: Option<QueueConfiguration>,
}

impl BrokerAddressSpec {
    /// Declared queue name, treating an empty name as absent
    pub fn queue(&self) -> Option<&str> {
        self.queue_name.as_deref().filter(|q| !q.is_empty())
    }
}

/// Queue settings sent to the broker
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_if_exists: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_routing_type"))]
    pub routing_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// -1 means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = -1))]
    pub max_consumers: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_rebalance: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_buckets: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_destructive: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge_on_no_consumers: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumers_before_dispatch: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_before_dispatch: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete_delay: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete_message_count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_managed: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_create_address: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_cluster_spec_defaults() {
        let spec: BrokerClusterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.deployment_plan.size, 1);
        assert!(spec.version.is_none());
        assert!(spec.deployment_plan.extra_mounts.is_empty());
        assert!(!spec.console.ssl_enabled);
    }

    #[test]
    fn test_cluster_spec_camel_case() {
        let spec: BrokerClusterSpec = serde_json::from_value(serde_json::json!({
            "version": "2.28",
            "deploymentPlan": {
                "size": 3,
                "initImage": "init:1",
                "extraMounts": { "secrets": ["broker-jaas-config"] },
                "podDisruptionBudget": { "maxUnavailable": "1" }
            },
            "console": { "sslEnabled": true, "sslSecret": "tls" }
        }))
        .unwrap();

        assert_eq!(spec.deployment_plan.size, 3);
        assert_eq!(spec.deployment_plan.init_image.as_deref(), Some("init:1"));
        assert_eq!(
            spec.deployment_plan.extra_mounts.secrets,
            vec!["broker-jaas-config"]
        );
        assert!(spec.console.ssl_enabled);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_cluster_spec_validation() {
        let mut spec = BrokerClusterSpec::default();
        spec.deployment_plan.size = 101;
        assert!(spec.validate().is_err());

        let mut spec = BrokerClusterSpec::default();
        spec.deployment_plan.extra_mounts.config_maps = vec!["Not_Valid".to_string()];
        assert!(spec.validate().is_err());

        let mut spec = BrokerClusterSpec::default();
        spec.deployment_plan.pod_disruption_budget = Some(PodDisruptionBudgetSpec {
            min_available: Some("half".to_string()),
            ..Default::default()
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_address_spec_validation() {
        let spec = BrokerAddressSpec {
            address_name: "orders".to_string(),
            routing_type: Some("ANYCAST".to_string()),
            apply_to_cluster_names: vec!["*".to_string(), "broker".to_string()],
            ..Default::default()
        };
        assert!(spec.validate().is_ok());

        let spec = BrokerAddressSpec {
            address_name: "orders".to_string(),
            routing_type: Some("BROADCAST".to_string()),
            ..Default::default()
        };
        assert!(spec.validate().is_err());

        let spec = BrokerAddressSpec::default();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_address_queue_ignores_empty_name() {
        let mut spec = BrokerAddressSpec {
            address_name: "orders".to_string(),
            queue_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(spec.queue(), None);
        spec.queue_name = Some("orders.q".to_string());
        assert_eq!(spec.queue(), Some("orders.q"));
    }

    #[test]
    fn test_condition_same_as_ignores_time_and_generation() {
        let a = Condition::new(
            condition_types::VALID,
            ConditionStatus::True,
            "ok",
            "",
        )
        .with_generation(1);
        let mut b = a.clone();
        b.last_transition_time = None;
        b.observed_generation = 7;
        assert!(a.same_as(&b));

        b.message = "changed".to_string();
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_set_condition_replaces_by_type() {
        let mut conditions = Vec::new();
        let mut first = Condition::new("Valid", ConditionStatus::False, "x", "");
        first.last_transition_time = Some("t0".to_string());
        set_condition(&mut conditions, first);
        set_condition(
            &mut conditions,
            Condition::new("Valid", ConditionStatus::False, "y", ""),
        );
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "r", ""),
        );

        assert_eq!(conditions.len(), 2);
        let valid = find_condition(&conditions, "Valid").unwrap();
        assert_eq!(valid.reason, "y");
        // status unchanged, transition time kept
        assert_eq!(valid.last_transition_time.as_deref(), Some("t0"));

        set_condition(
            &mut conditions,
            Condition::new("Valid", ConditionStatus::True, "z", ""),
        );
        let valid = find_condition(&conditions, "Valid").unwrap();
        assert_ne!(valid.last_transition_time.as_deref(), Some("t0"));
    }

    #[test]
    fn test_condition_serialization() {
        let cond = Condition::new("Ready", ConditionStatus::Unknown, "r", "m");
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "Unknown");
        assert!(json.get("observedGeneration").is_some());
    }

    #[test]
    fn test_crd_generation() {
        let crd = BrokerCluster::crd();
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "BrokerCluster");

        let crd = BrokerAddress::crd();
        assert_eq!(crd.spec.names.plural, "brokeraddresses");
    }
}
