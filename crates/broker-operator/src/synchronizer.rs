//! Address/queue synchronizer
//!
//! Fans management calls out over every replica of the targeted clusters,
//! one replica at a time, keeping per-replica failure detail.
//!
//! Apply runs in two phases: the address is ensured on every replica first,
//! then the queue (when declared) on every replica whose address step
//! succeeded. Deleting a queue continues past failures and only removes the
//! address from replicas where no binding remains. Deleting a bare address
//! stops at the first failure. A replica that no longer has the queue or
//! address counts as removed.

use crate::crd::BrokerAddressSpec;
use crate::error::{ApplyError, OperatorError, Result};
use crate::management::{
    queue_payload, CallError, CreationError, ManagementClient, ManagementConnector,
    DEFAULT_ROUTING_TYPE,
};
use crate::naming::TargetSelector;
use crate::store::KubeStore;
use crate::targets::{ReplicaTarget, ResolvedTargets, TargetResolver};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct Synchronizer {
    store: Arc<dyn KubeStore>,
    connector: Arc<dyn ManagementConnector>,
    cluster_domain: String,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn KubeStore>,
        connector: Arc<dyn ManagementConnector>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            connector,
            cluster_domain: cluster_domain.into(),
        }
    }

    async fn resolve(&self, namespace: &str, spec: &BrokerAddressSpec) -> Result<ResolvedTargets> {
        let selector = TargetSelector::from_names(&spec.apply_to_cluster_names);
        TargetResolver::new(self.store.as_ref(), &self.cluster_domain)
            .resolve(namespace, &selector)
            .await
    }

    /// Ensure the address (and queue) exist on every target replica
    pub async fn apply(&self, namespace: &str, spec: &BrokerAddressSpec) -> Result<()> {
        let address = spec.address_name.as_str();
        let resolved = self.resolve(namespace, spec).await?;
        if resolved.is_empty() {
            return Err(OperatorError::NoManagementClient(format!(
                "no broker replicas found for address {}",
                address
            )));
        }

        let payload = queue_payload(spec)?;
        let routing_type = spec.routing_type.as_deref().unwrap_or(DEFAULT_ROUTING_TYPE);
        let mut failures = ApplyError::new(format!("apply address {}", address));
        for replica in &resolved.unavailable {
            failures.add_transient(&replica.fqdn, &replica.reason);
        }

        let mut with_address = Vec::with_capacity(resolved.targets.len());
        for target in resolved.targets {
            let client = self.connector.connect(&target);
            match client.create_address(address, routing_type).await {
                Ok(_) => {
                    info!(target = %target.fqdn, address = %address, "Created address");
                    with_address.push((target, client));
                }
                Err(e) if e.is(CreationError::AddressAlreadyExists) => {
                    debug!(target = %target.fqdn, address = %address, "Address already exists");
                    with_address.push((target, client));
                }
                Err(e) => {
                    error!(target = %target.fqdn, address = %address, error = %e, "Failed to create address");
                    record(&mut failures, &target, &e);
                }
            }
        }

        if let (Some(payload), Some(queue)) = (payload, spec.queue()) {
            for (target, client) in &with_address {
                let created = client
                    .create_queue_from_config(&payload.config, payload.ignore_if_exists)
                    .await;
                let outcome = match created {
                    Err(e) if e.is(CreationError::QueueAlreadyExists) => {
                        debug!(target = %target.fqdn, queue = %queue, "Queue exists, updating");
                        client.update_queue(&payload.config).await.map(|_| "Updated queue")
                    }
                    other => other.map(|_| "Created queue"),
                };
                match outcome {
                    Ok(message) => info!(target = %target.fqdn, address = %address, queue = %queue, "{}", message),
                    Err(e) => {
                        error!(target = %target.fqdn, address = %address, queue = %queue, error = %e, "Failed to ensure queue");
                        record(&mut failures, target, &e);
                    }
                }
            }
        }

        failures.into_result().map_err(OperatorError::from)
    }

    /// Remove the queue, or the bare address, from every target replica
    pub async fn remove(&self, namespace: &str, spec: &BrokerAddressSpec) -> Result<()> {
        let resolved = self.resolve(namespace, spec).await?;
        if resolved.is_empty() {
            info!(address = %spec.address_name, "No broker replicas to remove address from");
            return Ok(());
        }
        match spec.queue() {
            Some(queue) => self.remove_queue(spec, queue, resolved).await,
            None => self.remove_address(spec, resolved).await,
        }
    }

    async fn remove_queue(
        &self,
        spec: &BrokerAddressSpec,
        queue: &str,
        resolved: ResolvedTargets,
    ) -> Result<()> {
        let address = spec.address_name.as_str();
        let mut failures = ApplyError::new(format!("delete queue {}", queue));
        for replica in &resolved.unavailable {
            failures.add_transient(&replica.fqdn, &replica.reason);
        }

        let mut queue_deleted: Vec<(ReplicaTarget, Arc<dyn ManagementClient>)> = Vec::new();
        for target in resolved.targets {
            let client = self.connector.connect(&target);
            match client.delete_queue(queue).await {
                Ok(_) => {
                    info!(target = %target.fqdn, queue = %queue, "Deleted queue");
                    queue_deleted.push((target, client));
                }
                Err(e) if e.is(CreationError::QueueDoesNotExist) => {
                    debug!(target = %target.fqdn, queue = %queue, "Queue already gone");
                    queue_deleted.push((target, client));
                }
                Err(e) => {
                    error!(target = %target.fqdn, queue = %queue, error = %e, "Failed to delete queue");
                    record(&mut failures, &target, &e);
                }
            }
        }

        // the address goes only where no other queue is bound to it
        for (target, client) in &queue_deleted {
            match client.list_bindings_for_address(address).await {
                Ok(bindings) if bindings.has_bindings() => {
                    info!(target = %target.fqdn, address = %address, bindings = %bindings.value, "Address still has bindings, keeping it");
                }
                Ok(_) => match client.delete_address(address).await {
                    Ok(_) => info!(target = %target.fqdn, address = %address, "Deleted address"),
                    Err(e) if e.is(CreationError::AddressDoesNotExist) => {
                        debug!(target = %target.fqdn, address = %address, "Address already gone")
                    }
                    Err(e) => warn!(target = %target.fqdn, address = %address, error = %e, "Failed to delete address"),
                },
                Err(e) => {
                    warn!(target = %target.fqdn, address = %address, error = %e, "Failed to list bindings")
                }
            }
        }

        failures.into_result().map_err(OperatorError::from)
    }

    async fn remove_address(&self, spec: &BrokerAddressSpec, resolved: ResolvedTargets) -> Result<()> {
        let address = spec.address_name.as_str();
        if let Some(replica) = resolved.unavailable.first() {
            return Err(OperatorError::NoManagementClient(format!(
                "{}: {}",
                replica.fqdn, replica.reason
            )));
        }
        for target in &resolved.targets {
            let client = self.connector.connect(target);
            match client.delete_address(address).await {
                Ok(_) => info!(target = %target.fqdn, address = %address, "Deleted address"),
                Err(e) if e.is(CreationError::AddressDoesNotExist) => {
                    debug!(target = %target.fqdn, address = %address, "Address already gone")
                }
                Err(e) => {
                    error!(target = %target.fqdn, address = %address, error = %e, "Failed to delete address");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn record(failures: &mut ApplyError, target: &ReplicaTarget, err: &CallError) {
    if err.is_transient() {
        failures.add_transient(&target.fqdn, err.to_string());
    } else {
        failures.add(&target.fqdn, err.to_string());
    }
}
