//! Status projection for `BrokerCluster`
//!
//! The status is recomputed on every reconciliation from the declaration and
//! what is observed in the cluster. It is never read back as input, except
//! to keep condition transition times stable.

use crate::crd::{
    condition_reasons, condition_types, find_condition, set_condition, BrokerCluster,
    BrokerClusterStatus, Condition, ConditionStatus, ExternalConfigStatus, PodStatusSummary,
    VersionStatus,
};
use crate::error::Result;
use crate::naming::{pod_ordinal, ClusterNames, ObjectKey};
use crate::store::KubeStore;
use crate::versions;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeSet;

/// Live state the projection is computed from
#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub pods: Vec<Pod>,
    pub external_configs: Vec<ExternalConfigStatus>,
}

/// Read the broker pods and the extra mounts of `cluster`
pub async fn observe(store: &dyn KubeStore, cluster: &BrokerCluster) -> Result<Observed> {
    let namespace = cluster.namespace().unwrap_or_default();
    let names = ClusterNames::for_cluster(cluster);
    let pods = store
        .list_pods(&namespace, &names.label_selector())
        .await?;

    let mounts = &cluster.spec.deployment_plan.extra_mounts;
    let mut external_configs = Vec::new();
    for name in &mounts.config_maps {
        if let Some(cm) = store.get_config_map(&ObjectKey::new(&namespace, name)).await? {
            external_configs.push(external_config(name, cm.resource_version()));
        }
    }
    for name in &mounts.secrets {
        if let Some(secret) = store.get_secret(&ObjectKey::new(&namespace, name)).await? {
            external_configs.push(external_config(name, secret.resource_version()));
        }
    }

    Ok(Observed {
        pods,
        external_configs,
    })
}

fn external_config(name: &str, resource_version: Option<String>) -> ExternalConfigStatus {
    ExternalConfigStatus {
        name: name.to_string(),
        resource_version: resource_version.unwrap_or_default(),
    }
}

/// Whether a pod reports the `Ready` condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Ready, starting and stopped pods of the plan
///
/// Expected pods that do not exist are reported as stopped.
pub fn summarize_pods(names: &ClusterNames, size: i32, pods: &[Pod]) -> PodStatusSummary {
    let mut summary = PodStatusSummary::default();
    let mut seen = BTreeSet::new();
    for pod in pods {
        let name = pod.name_any();
        if let Some(ordinal) = pod_ordinal(&name, &names.statefulset) {
            seen.insert(ordinal);
        }
        if is_pod_ready(pod) {
            summary.ready.push(name);
        } else {
            summary.starting.push(name);
        }
    }
    for ordinal in 0..size.max(0) as u32 {
        if !seen.contains(&ordinal) {
            summary.stopped.push(names.pod_name(ordinal));
        }
    }
    summary.ready.sort();
    summary.starting.sort();
    summary.stopped.sort();
    summary
}

/// Resolved version and images for the declaration
pub fn version_status(cluster: &BrokerCluster) -> VersionStatus {
    let spec = &cluster.spec;
    let plan = &spec.deployment_plan;
    let image_pinned = versions::is_pinned(plan.image.as_deref());
    let init_pinned = versions::is_pinned(plan.init_image.as_deref());

    let broker_version = match spec.version.as_deref().and_then(versions::resolve) {
        Some(v) => v.to_string(),
        // pinned images without a version carry their own
        None if image_pinned && init_pinned => String::new(),
        None => versions::latest().to_string(),
    };
    let image = match &plan.image {
        Some(image) if image_pinned => image.clone(),
        _ => versions::default_image(&broker_version),
    };
    let init_image = match &plan.init_image {
        Some(image) if init_pinned => image.clone(),
        _ => versions::default_init_image(&broker_version),
    };
    VersionStatus {
        image,
        init_image,
        broker_version,
    }
}

/// Project the status of `cluster`
///
/// `provisioning_error` is the message of a failed provisioning step, if any.
/// Conditions of `previous` keep their transition time while their status is
/// unchanged.
pub fn project(
    cluster: &BrokerCluster,
    previous: Option<&BrokerClusterStatus>,
    valid: &Condition,
    provisioning_error: Option<&str>,
    observed: &Observed,
) -> BrokerClusterStatus {
    let names = ClusterNames::for_cluster(cluster);
    let size = cluster.spec.deployment_plan.size;
    let generation = cluster.metadata.generation.unwrap_or_default();
    let pod_status = summarize_pods(&names, size, &observed.pods);

    let deployed = match provisioning_error {
        Some(message) => Condition::new(
            condition_types::DEPLOYED,
            ConditionStatus::False,
            condition_reasons::PROVISIONING_FAILED,
            message,
        ),
        None if pod_status.ready.len() as i32 >= size && pod_status.starting.is_empty() => {
            Condition::new(
                condition_types::DEPLOYED,
                ConditionStatus::True,
                condition_reasons::ALL_PODS_READY,
                "",
            )
        }
        None => Condition::new(
            condition_types::DEPLOYED,
            ConditionStatus::False,
            condition_reasons::PODS_NOT_READY,
            format!("{}/{} pods ready", pod_status.ready.len(), size),
        ),
    };

    let mut conditions: Vec<Condition> = previous
        .map(|s| {
            s.conditions
                .iter()
                .filter(|c| {
                    [
                        condition_types::VALID,
                        condition_types::DEPLOYED,
                        condition_types::READY,
                    ]
                    .contains(&c.type_.as_str())
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    set_condition(&mut conditions, valid.clone().with_generation(generation));
    set_condition(&mut conditions, deployed.with_generation(generation));
    let ready = ready_condition(&conditions).with_generation(generation);
    set_condition(&mut conditions, ready);

    let mut external_configs = observed.external_configs.clone();
    external_configs.sort_by(|a, b| a.name.cmp(&b.name));

    BrokerClusterStatus {
        deployment_plan_size: size,
        scale_label_selector: names.label_selector(),
        version: version_status(cluster),
        external_configs,
        pod_status,
        conditions,
    }
}

/// Aggregate `Ready` condition, True iff every other condition is True
pub fn ready_condition(conditions: &[Condition]) -> Condition {
    let not_ready: Vec<&str> = conditions
        .iter()
        .filter(|c| c.type_ != condition_types::READY && !c.is_true())
        .map(|c| c.type_.as_str())
        .collect();
    if not_ready.is_empty() {
        Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            condition_reasons::READY,
            "",
        )
    } else {
        Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            condition_reasons::NOT_READY,
            format!("not ready: {}", not_ready.join(", ")),
        )
    }
}

/// Whether the status has settled
pub fn is_quiescent(status: &BrokerClusterStatus) -> bool {
    find_condition(&status.conditions, condition_types::READY).is_some_and(Condition::is_true)
}

/// Order-independent structural comparison of two condition sets
pub fn conditions_equal(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|x| find_condition(b, &x.type_).is_some_and(|y| x.same_as(y)))
}

/// Structural status comparison, ignoring condition order and transition times
pub fn status_equal(a: &BrokerClusterStatus, b: &BrokerClusterStatus) -> bool {
    a.deployment_plan_size == b.deployment_plan_size
        && a.scale_label_selector == b.scale_label_selector
        && a.version == b.version
        && a.external_configs == b.external_configs
        && a.pod_status == b.pod_status
        && conditions_equal(&a.conditions, &b.conditions)
}
