//! Idempotence records
//!
//! After a successful synchronization the declaration's resource version is
//! stored in a labelled ConfigMap next to it. A later reconciliation whose
//! resource version matches the stored checksum skips the remote calls.
//!
//! Records are named `<declaration>-<kind>-reconciled` and carry the labels
//! chosen by the owner plus [`RECORD_KIND_LABEL`], so two declarations sharing
//! a name across kinds never see each other's record.

use crate::error::Result;
use crate::naming::{to_selector, ObjectKey};
use crate::store::KubeStore;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Label carrying the record's kind tag
pub const RECORD_KIND_LABEL: &str = "broker.operator.dev/reconciled-kind";

const CHECKSUM_KEY: &str = "checksum";
const SNAPSHOT_KEY: &str = "snapshot";
const KIND_KEY: &str = "kind";

/// Last successfully reconciled state of a declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledRecord {
    pub owner: ObjectKey,
    pub kind: String,
    /// JSON snapshot of the declaration
    pub snapshot: String,
    /// Resource version of the declaration
    pub checksum: String,
    pub labels: BTreeMap<String, String>,
}

impl ReconciledRecord {
    pub fn name(&self) -> String {
        record_name(&self.owner, &self.kind)
    }

    fn to_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: Some(self.owner.namespace.clone()),
                labels: Some(record_labels(&self.labels, &self.kind)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (CHECKSUM_KEY.to_string(), self.checksum.clone()),
                (SNAPSHOT_KEY.to_string(), self.snapshot.clone()),
                (KIND_KEY.to_string(), self.kind.clone()),
            ])),
            ..Default::default()
        }
    }

    fn from_config_map(owner: &ObjectKey, kind: &str, cm: &ConfigMap) -> Option<Self> {
        let data = cm.data.as_ref()?;
        let mut labels = cm.labels().clone();
        labels.remove(RECORD_KIND_LABEL);
        Some(Self {
            owner: owner.clone(),
            kind: data.get(KIND_KEY).cloned().unwrap_or_else(|| kind.to_string()),
            snapshot: data.get(SNAPSHOT_KEY).cloned().unwrap_or_default(),
            checksum: data.get(CHECKSUM_KEY)?.clone(),
            labels,
        })
    }
}

fn record_name(owner: &ObjectKey, kind: &str) -> String {
    format!("{}-{}-reconciled", owner.name, kind)
}

fn record_labels(labels: &BTreeMap<String, String>, kind: &str) -> BTreeMap<String, String> {
    let mut labels = labels.clone();
    labels.insert(RECORD_KIND_LABEL.to_string(), kind.to_string());
    labels
}

/// Checksum-gated skip of repeated synchronization work
#[derive(Clone)]
pub struct IdempotenceCache {
    store: Arc<dyn KubeStore>,
}

impl IdempotenceCache {
    pub fn new(store: Arc<dyn KubeStore>) -> Self {
        Self { store }
    }

    /// Stored record for `owner`, selected by kind tag and labels
    pub async fn lookup(
        &self,
        owner: &ObjectKey,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Option<ReconciledRecord>> {
        let selector = to_selector(&record_labels(labels, kind));
        let name = record_name(owner, kind);
        let record = self
            .store
            .list_config_maps(&owner.namespace, &selector)
            .await?
            .iter()
            .find(|cm| cm.name_any() == name)
            .and_then(|cm| ReconciledRecord::from_config_map(owner, kind, cm));
        Ok(record)
    }

    /// Whether the stored checksum equals `checksum`
    pub async fn is_unchanged(
        &self,
        owner: &ObjectKey,
        kind: &str,
        labels: &BTreeMap<String, String>,
        checksum: &str,
    ) -> Result<bool> {
        Ok(self
            .lookup(owner, kind, labels)
            .await?
            .is_some_and(|r| r.checksum == checksum))
    }

    /// Replace the stored record
    pub async fn store(&self, record: &ReconciledRecord) -> Result<()> {
        let key = ObjectKey::new(&record.owner.namespace, record.name());
        self.store.delete_config_map(&key).await?;
        self.store
            .create_config_map(&record.owner.namespace, &record.to_config_map())
            .await?;
        debug!(record = %key, checksum = %record.checksum, "Stored reconciled record");
        Ok(())
    }

    /// Delete the record of `owner`
    pub async fn remove(&self, owner: &ObjectKey, kind: &str) -> Result<()> {
        let key = ObjectKey::new(&owner.namespace, record_name(owner, kind));
        self.store.delete_config_map(&key).await?;
        debug!(record = %key, "Removed reconciled record");
        Ok(())
    }
}
