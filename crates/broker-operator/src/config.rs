//! Operator-wide settings shared by every controller

use crate::error::{OperatorError, Result};
use crate::naming::DEFAULT_CLUSTER_DOMAIN;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Default period between resync reconciliations
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Default deadline for a single management call
pub const DEFAULT_MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for establishing a management connection
pub const DEFAULT_MANAGEMENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default broker management (HTTP) port
pub const DEFAULT_MANAGEMENT_PORT: u16 = 8161;

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, `None` for cluster-wide
    pub namespace: Option<String>,
    pub resync_period: Duration,
    pub cluster_domain: String,
    /// Syntax check for JAAS mounts, disabled when `None`
    pub jaas_syntax: Option<Regex>,
    pub management_timeout: Duration,
    pub management_connect_timeout: Duration,
    pub management_port: u16,
    /// PEM bundle trusted for HTTPS management endpoints, in addition to the
    /// system roots
    pub management_ca_cert: Option<PathBuf>,
    /// Skip certificate verification for HTTPS management endpoints
    pub management_insecure: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period: DEFAULT_RESYNC_PERIOD,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            jaas_syntax: None,
            management_timeout: DEFAULT_MANAGEMENT_TIMEOUT,
            management_connect_timeout: DEFAULT_MANAGEMENT_CONNECT_TIMEOUT,
            management_port: DEFAULT_MANAGEMENT_PORT,
            management_ca_cert: None,
            management_insecure: false,
        }
    }
}

impl OperatorConfig {
    /// Compile the JAAS syntax pattern; an empty pattern disables the check
    pub fn with_jaas_syntax(mut self, pattern: &str) -> Result<Self> {
        self.jaas_syntax = if pattern.trim().is_empty() {
            None
        } else {
            Some(Regex::new(pattern).map_err(|e| {
                OperatorError::InvalidConfig(format!("JAAS syntax pattern: {}", e))
            })?)
        };
        Ok(self)
    }

    /// Empty namespace means cluster-wide
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        self
    }

    pub fn with_cluster_domain(mut self, domain: &str) -> Self {
        if !domain.is_empty() {
            self.cluster_domain = domain.to_string();
        }
        self
    }

    /// Empty path means system roots only
    pub fn with_management_ca_cert(mut self, path: &str) -> Self {
        self.management_ca_cert = (!path.is_empty()).then(|| PathBuf::from(path));
        self
    }
}
