//! # Broker Kubernetes Operator
//!
//! Kubernetes operator for multi-replica message broker clusters and the
//! addresses and queues that live on them.
//!
//! ## Features
//!
//! - **Custom Resource Definitions**: `BrokerCluster` for the replica set and
//!   `BrokerAddress` for addresses/queues that must exist on every replica
//! - **Validation as data**: declaration problems surface as a `Valid`
//!   condition instead of log noise
//! - **Status projection**: per-pod readiness, resolved versions and images,
//!   mounted config versions, and an aggregate `Ready` condition
//! - **Address fan-out**: addresses and queues are created, updated and
//!   deleted on every broker replica through its management endpoint
//! - **Idempotence**: unchanged declarations make no remote calls
//! - **Pluggable security**: config handlers contribute init-container
//!   configuration and force reconciles when they come and go
//! - **Observability**: Prometheus-compatible operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use broker_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let store = Arc::new(KubeApiStore::new(client.clone()));
//!     let (trigger, triggers) = mpsc::unbounded_channel();
//!
//!     let ctx = Arc::new(Context {
//!         store: store.clone(),
//!         registry: Arc::new(ConfigHandlerRegistry::new(store, trigger)),
//!         provisioner: Arc::new(KubeProvisioner::new(client.clone())),
//!         config: OperatorConfig::default(),
//!         metrics: None,
//!     });
//!     run_controller(client, ctx, triggers).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Validate**: run the validation chain and produce the `Valid` condition
//! 2. **Process**: when valid, provision the broker resources, passing the
//!    applicable config handler
//! 3. **Project**: recompute the status from the declaration and live pods
//! 4. **Commit**: write the status once, only when it changed
//!
//! Address declarations run through their own finalizer-driven controller,
//! which hands the work to the [`synchronizer`].
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`controller`] - BrokerCluster reconciliation state machine
//! - [`address_controller`] - BrokerAddress lifecycle and pod-restart observer
//! - [`synchronizer`] - address/queue fan-out across broker replicas
//! - [`config_handler`] - security config handler registry
//! - [`validation`] / [`status`] - validation chain and status projection
//! - [`resources`] - StatefulSet, Service and PDB builders
//! - [`error`] - error taxonomy with retry directives
//!
//! ## Custom Resource Definitions
//!
//! ### BrokerCluster
//!
//! ```yaml
//! apiVersion: broker.operator.dev/v1beta1
//! kind: BrokerCluster
//! metadata:
//!   name: production
//! spec:
//!   version: "2.30"
//!   deploymentPlan:
//!     size: 3
//!     extraMounts:
//!       configMaps: ["production-logging-config"]
//! ```
//!
//! ### BrokerAddress
//!
//! ```yaml
//! apiVersion: broker.operator.dev/v1beta1
//! kind: BrokerAddress
//! metadata:
//!   name: orders
//! spec:
//!   addressName: orders
//!   queueName: orders.q
//!   routingType: ANYCAST
//!   removeFromBrokerOnDelete: true
//! ```

pub mod address_controller;
pub mod config;
pub mod config_handler;
pub mod controller;
pub mod crd;
pub mod error;
pub mod idempotence;
pub mod management;
pub mod naming;
pub mod resources;
pub mod status;
pub mod store;
pub mod synchronizer;
pub mod targets;
pub mod validation;
pub mod versions;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::address_controller::{run_address_controller, AddressController};
    pub use crate::config::OperatorConfig;
    pub use crate::config_handler::{ConfigHandler, ConfigHandlerRegistry};
    pub use crate::controller::{reconcile_cluster, run_controller, Context};
    pub use crate::crd::{
        BrokerAddress, BrokerAddressSpec, BrokerCluster, BrokerClusterSpec, BrokerClusterStatus,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::management::{HttpConnector, ManagementClientConfig};
    pub use crate::resources::{KubeProvisioner, Provisioner};
    pub use crate::store::{KubeApiStore, KubeStore};
}
