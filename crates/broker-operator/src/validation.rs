//! Cluster declaration validation
//!
//! An ordered chain of checks; the first failing check decides the `Valid`
//! condition and the rest are skipped.
//!
//! 1. field constraints declared on the CRD
//! 2. extra mounts
//! 3. pod disruption budget
//! 4. console TLS secret
//! 5. broker version and image pinning

use crate::config::OperatorConfig;
use crate::crd::{
    condition_reasons, condition_types, BrokerCluster, BrokerClusterSpec, Condition,
    ConditionStatus,
};
use crate::error::Result;
use crate::naming::{ClusterNames, ObjectKey};
use crate::store::{secret_has_key, secret_value, KubeStore};
use crate::versions;
use kube::ResourceExt;
use tracing::debug;
use validator::Validate;

/// Suffix marking an extra mount as the logging configuration
pub const LOGGING_CONFIG_SUFFIX: &str = "-logging-config";

/// Key a logging mount must contain
pub const LOGGING_CONFIG_KEY: &str = "logging.properties";

/// Suffix marking an extra mount as the JAAS configuration
pub const JAAS_CONFIG_SUFFIX: &str = "-jaas-config";

/// Key a JAAS mount must contain
pub const JAAS_CONFIG_KEY: &str = "login.config";

const KEYSTORE_PASSWORD_KEY: &str = "keyStorePassword";
const TRUSTSTORE_PASSWORD_KEY: &str = "trustStorePassword";
const KEYSTORE_KEYS: [&str; 2] = ["keyStorePath", "broker.ks"];
const TRUSTSTORE_KEYS: [&str; 2] = ["trustStorePath", "client.ts"];

/// Result of validating one declaration
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// The `Valid` condition to install
    pub condition: Condition,
    /// Whether the failing check may pass later without a spec change
    pub retry: bool,
}

impl ValidationOutcome {
    fn passed() -> Self {
        Self {
            condition: Condition::new(
                condition_types::VALID,
                ConditionStatus::True,
                condition_reasons::VALIDATION,
                "",
            ),
            retry: false,
        }
    }

    fn failed(reason: &str, message: impl Into<String>, retry: bool) -> Self {
        Self {
            condition: Condition::new(
                condition_types::VALID,
                ConditionStatus::False,
                reason,
                message,
            ),
            retry,
        }
    }

    fn ambiguous(reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition: Condition::new(
                condition_types::VALID,
                ConditionStatus::Unknown,
                reason,
                message,
            ),
            retry: false,
        }
    }

    /// Processing only proceeds on a True condition
    pub fn is_valid(&self) -> bool {
        self.condition.is_true()
    }
}

type Check = Option<ValidationOutcome>;

pub struct Validator<'a> {
    store: &'a dyn KubeStore,
    config: &'a OperatorConfig,
}

impl<'a> Validator<'a> {
    pub fn new(store: &'a dyn KubeStore, config: &'a OperatorConfig) -> Self {
        Self { store, config }
    }

    /// Run the chain against `cluster`
    pub async fn validate(&self, cluster: &BrokerCluster) -> Result<ValidationOutcome> {
        let namespace = cluster.namespace().unwrap_or_default();
        let spec = &cluster.spec;

        let outcome = match check_fields(spec) {
            Some(failed) => failed,
            None => match self.check_extra_mounts(&namespace, spec).await? {
                Some(failed) => failed,
                None => match check_pod_disruption_budget(spec) {
                    Some(failed) => failed,
                    None => match self.check_console(&namespace, cluster).await? {
                        Some(failed) => failed,
                        None => check_version(spec).unwrap_or_else(ValidationOutcome::passed),
                    },
                },
            },
        };

        let outcome = ValidationOutcome {
            condition: outcome
                .condition
                .with_generation(cluster.metadata.generation.unwrap_or_default()),
            ..outcome
        };
        debug!(
            name = %cluster.name_any(),
            status = %outcome.condition.status,
            reason = %outcome.condition.reason,
            retry = outcome.retry,
            "Validated cluster"
        );
        Ok(outcome)
    }

    async fn check_extra_mounts(&self, namespace: &str, spec: &BrokerClusterSpec) -> Result<Check> {
        let mounts = &spec.deployment_plan.extra_mounts;
        let mut logging_mounts = 0;
        let mut jaas_mounts = 0;

        for name in &mounts.config_maps {
            let key = ObjectKey::new(namespace, name);
            let Some(cm) = self.store.get_config_map(&key).await? else {
                return Ok(Some(missing(&key, "ConfigMap")));
            };
            if name.ends_with(JAAS_CONFIG_SUFFIX) {
                return Ok(Some(ValidationOutcome::failed(
                    condition_reasons::INVALID_EXTRA_MOUNT,
                    format!(
                        "JAAS config {} must be mounted from a Secret, not a ConfigMap",
                        name
                    ),
                    false,
                )));
            }
            if name.ends_with(LOGGING_CONFIG_SUFFIX) {
                logging_mounts += 1;
                let has_key = cm
                    .data
                    .as_ref()
                    .is_some_and(|d| d.contains_key(LOGGING_CONFIG_KEY));
                if !has_key {
                    return Ok(Some(missing_key(name, LOGGING_CONFIG_KEY)));
                }
            }
        }

        for name in &mounts.secrets {
            let key = ObjectKey::new(namespace, name);
            let Some(secret) = self.store.get_secret(&key).await? else {
                return Ok(Some(missing(&key, "Secret")));
            };
            if name.ends_with(LOGGING_CONFIG_SUFFIX) {
                logging_mounts += 1;
                if !secret_has_key(&secret, LOGGING_CONFIG_KEY) {
                    return Ok(Some(missing_key(name, LOGGING_CONFIG_KEY)));
                }
            }
            if name.ends_with(JAAS_CONFIG_SUFFIX) {
                jaas_mounts += 1;
                let Some(content) = secret_value(&secret, JAAS_CONFIG_KEY) else {
                    return Ok(Some(missing_key(name, JAAS_CONFIG_KEY)));
                };
                if let Some(syntax) = &self.config.jaas_syntax {
                    if !syntax.is_match(&content) {
                        return Ok(Some(ValidationOutcome::failed(
                            condition_reasons::INVALID_EXTRA_MOUNT,
                            format!(
                                "{} in Secret {} does not match the configured syntax {}",
                                JAAS_CONFIG_KEY,
                                name,
                                syntax.as_str()
                            ),
                            false,
                        )));
                    }
                }
            }
        }

        let duplicate = if logging_mounts > 1 {
            Some("logging")
        } else if jaas_mounts > 1 {
            Some("JAAS")
        } else {
            None
        };
        Ok(duplicate.map(|purpose| {
            ValidationOutcome::failed(
                condition_reasons::DUPLICATE_EXTRA_MOUNT,
                format!("only one {} config may be mounted", purpose),
                false,
            )
        }))
    }

    async fn check_console(&self, namespace: &str, cluster: &BrokerCluster) -> Result<Check> {
        if !cluster.spec.console.ssl_enabled {
            return Ok(None);
        }
        let names = ClusterNames::for_cluster(cluster);
        let key = ObjectKey::new(namespace, &names.console_secret);
        let Some(secret) = self.store.get_secret(&key).await? else {
            return Ok(Some(ValidationOutcome::failed(
                condition_reasons::INVALID_CONSOLE_SECRET,
                format!("console secret {} not found", key.name),
                true,
            )));
        };

        let mut absent: Vec<&str> = [KEYSTORE_PASSWORD_KEY, TRUSTSTORE_PASSWORD_KEY]
            .into_iter()
            .filter(|k| !secret_has_key(&secret, k))
            .collect();
        for alternatives in [KEYSTORE_KEYS, TRUSTSTORE_KEYS] {
            if !alternatives.iter().any(|k| secret_has_key(&secret, k)) {
                absent.push(alternatives[0]);
            }
        }
        if absent.is_empty() {
            return Ok(None);
        }
        Ok(Some(ValidationOutcome::failed(
            condition_reasons::INVALID_CONSOLE_SECRET,
            format!(
                "console secret {} is missing {}",
                key.name,
                absent.join(", ")
            ),
            false,
        )))
    }
}

fn missing(key: &ObjectKey, kind: &str) -> ValidationOutcome {
    ValidationOutcome::failed(
        condition_reasons::MISSING_RESOURCES,
        format!("{} {} not found", kind, key.name),
        true,
    )
}

fn missing_key(mount: &str, key: &str) -> ValidationOutcome {
    ValidationOutcome::failed(
        condition_reasons::INVALID_EXTRA_MOUNT,
        format!("extra mount {} must contain {}", mount, key),
        false,
    )
}

fn check_fields(spec: &BrokerClusterSpec) -> Check {
    let errors = spec.validate().err()?;
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    if messages.is_empty() {
        messages.push(errors.to_string());
    }
    messages.sort();
    Some(ValidationOutcome::failed(
        condition_reasons::SPEC_INVALID,
        messages.join("; "),
        false,
    ))
}

fn check_pod_disruption_budget(spec: &BrokerClusterSpec) -> Check {
    let pdb = spec.deployment_plan.pod_disruption_budget.as_ref()?;
    pdb.selector.as_ref()?;
    Some(ValidationOutcome::failed(
        condition_reasons::PDB_NON_NIL_SELECTOR,
        "podDisruptionBudget.selector must not be set; the operator derives it",
        false,
    ))
}

fn check_version(spec: &BrokerClusterSpec) -> Check {
    let plan = &spec.deployment_plan;
    let image_pinned = versions::is_pinned(plan.image.as_deref());
    let init_pinned = versions::is_pinned(plan.init_image.as_deref());

    match spec.version.as_deref().filter(|v| !v.is_empty()) {
        Some(declared) => {
            if versions::resolve(declared).is_none() {
                return Some(ValidationOutcome::failed(
                    condition_reasons::SPEC_VERSION_INVALID,
                    format!(
                        "version {} is not supported, supported versions are {}",
                        declared,
                        versions::SUPPORTED_VERSIONS.join(", ")
                    ),
                    false,
                ));
            }
            if image_pinned || init_pinned {
                return Some(ValidationOutcome::ambiguous(
                    condition_reasons::IMAGE_VERSION_CONFLICT,
                    format!(
                        "version {} is declared together with a pinned image; remove one of them",
                        declared
                    ),
                ));
            }
            None
        }
        None if image_pinned != init_pinned => Some(ValidationOutcome::ambiguous(
            condition_reasons::IMAGE_DEPENDENT_PAIR,
            "image and initImage must be pinned together",
        )),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PodDisruptionBudgetSpec, PodSelector};
    use crate::testing::{test_cluster, FakeStore};

    async fn validate_with(
        store: &FakeStore,
        config: &OperatorConfig,
        spec: BrokerClusterSpec,
    ) -> ValidationOutcome {
        let cluster = test_cluster("broker", spec);
        Validator::new(store, config)
            .validate(&cluster)
            .await
            .unwrap()
    }

    async fn validate(store: &FakeStore, spec: BrokerClusterSpec) -> ValidationOutcome {
        validate_with(store, &OperatorConfig::default(), spec).await
    }

    #[tokio::test]
    async fn test_default_spec_is_valid() {
        let outcome = validate(&FakeStore::new(), BrokerClusterSpec::default()).await;
        assert!(outcome.is_valid());
        assert_eq!(outcome.condition.reason, condition_reasons::VALIDATION);
        assert_eq!(outcome.condition.observed_generation, 1);
        assert!(!outcome.retry);
    }

    #[tokio::test]
    async fn test_field_constraints() {
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.size = -1;
        let outcome = validate(&FakeStore::new(), s).await;
        assert_eq!(outcome.condition.status, ConditionStatus::False);
        assert_eq!(outcome.condition.reason, condition_reasons::SPEC_INVALID);
    }

    #[tokio::test]
    async fn test_missing_extra_mount_retries() {
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.extra_mounts.config_maps = vec!["app-config".to_string()];
        let outcome = validate(&FakeStore::new(), s).await;
        assert_eq!(outcome.condition.status, ConditionStatus::False);
        assert_eq!(outcome.condition.reason, condition_reasons::MISSING_RESOURCES);
        assert!(outcome.retry);
    }

    #[tokio::test]
    async fn test_logging_mount_needs_key() {
        let store = FakeStore::new();
        store.add_config_map("my-logging-config", &[("other", "x")]);
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.extra_mounts.config_maps = vec!["my-logging-config".to_string()];
        let outcome = validate(&store, s.clone()).await;
        assert_eq!(outcome.condition.reason, condition_reasons::INVALID_EXTRA_MOUNT);
        assert!(!outcome.retry);

        store.add_config_map("my-logging-config", &[(LOGGING_CONFIG_KEY, "x")]);
        assert!(validate(&store, s).await.is_valid());
    }

    #[tokio::test]
    async fn test_jaas_mount_must_be_secret() {
        let store = FakeStore::new();
        store.add_config_map("my-jaas-config", &[(JAAS_CONFIG_KEY, "x")]);
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.extra_mounts.config_maps = vec!["my-jaas-config".to_string()];
        let outcome = validate(&store, s).await;
        assert_eq!(outcome.condition.reason, condition_reasons::INVALID_EXTRA_MOUNT);
        assert!(outcome.condition.message.contains("Secret"));
    }

    #[tokio::test]
    async fn test_jaas_syntax() {
        let store = FakeStore::new();
        store.add_secret("my-jaas-config", &[(JAAS_CONFIG_KEY, "activemq { };")]);
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.extra_mounts.secrets = vec!["my-jaas-config".to_string()];

        // no pattern configured
        assert!(validate(&store, s.clone()).await.is_valid());

        let strict = OperatorConfig::default()
            .with_jaas_syntax(r"^\s*activemq\s*\{[\s\S]*\};\s*$")
            .unwrap();
        assert!(validate_with(&store, &strict, s.clone()).await.is_valid());

        store.add_secret("my-jaas-config", &[(JAAS_CONFIG_KEY, "garbage")]);
        let outcome = validate_with(&store, &strict, s).await;
        assert_eq!(outcome.condition.reason, condition_reasons::INVALID_EXTRA_MOUNT);
    }

    #[tokio::test]
    async fn test_duplicate_logging_mounts() {
        let store = FakeStore::new();
        store.add_config_map("a-logging-config", &[(LOGGING_CONFIG_KEY, "x")]);
        store.add_secret("b-logging-config", &[(LOGGING_CONFIG_KEY, "x")]);
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.extra_mounts.config_maps = vec!["a-logging-config".to_string()];
        s.deployment_plan.extra_mounts.secrets = vec!["b-logging-config".to_string()];
        let outcome = validate(&store, s).await;
        assert_eq!(outcome.condition.reason, condition_reasons::DUPLICATE_EXTRA_MOUNT);
    }

    #[tokio::test]
    async fn test_pdb_selector_rejected() {
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.pod_disruption_budget = Some(PodDisruptionBudgetSpec {
            selector: Some(PodSelector::default()),
            ..Default::default()
        });
        let outcome = validate(&FakeStore::new(), s).await;
        assert_eq!(outcome.condition.reason, condition_reasons::PDB_NON_NIL_SELECTOR);
    }

    #[tokio::test]
    async fn test_console_secret_keys() {
        let store = FakeStore::new();
        let mut s = BrokerClusterSpec::default();
        s.console.ssl_enabled = true;

        let outcome = validate(&store, s.clone()).await;
        assert_eq!(outcome.condition.reason, condition_reasons::INVALID_CONSOLE_SECRET);
        assert!(outcome.retry);

        store.add_secret(
            "broker-console-secret",
            &[(KEYSTORE_PASSWORD_KEY, "x"), ("broker.ks", "x")],
        );
        let outcome = validate(&store, s.clone()).await;
        assert!(outcome.condition.message.contains(TRUSTSTORE_PASSWORD_KEY));
        assert!(outcome.condition.message.contains("trustStorePath"));
        assert!(!outcome.retry);

        store.add_secret(
            "broker-console-secret",
            &[
                (KEYSTORE_PASSWORD_KEY, "x"),
                (TRUSTSTORE_PASSWORD_KEY, "x"),
                ("broker.ks", "x"),
                ("client.ts", "x"),
            ],
        );
        assert!(validate(&store, s).await.is_valid());
    }

    #[tokio::test]
    async fn test_version_checks() {
        let store = FakeStore::new();
        let mut s = BrokerClusterSpec::default();
        s.version = Some("1.0".to_string());
        let outcome = validate(&store, s.clone()).await;
        assert_eq!(outcome.condition.status, ConditionStatus::False);
        assert_eq!(outcome.condition.reason, condition_reasons::SPEC_VERSION_INVALID);

        s.version = Some("2.28".to_string());
        assert!(validate(&store, s.clone()).await.is_valid());

        s.deployment_plan.image = Some("registry/broker:custom".to_string());
        let outcome = validate(&store, s.clone()).await;
        assert_eq!(outcome.condition.status, ConditionStatus::Unknown);
        assert_eq!(outcome.condition.reason, condition_reasons::IMAGE_VERSION_CONFLICT);
        assert!(!outcome.is_valid());

        // an unsupported version wins over the pinning conflict
        s.version = Some("9.9.9".to_string());
        let outcome = validate(&store, s).await;
        assert_eq!(outcome.condition.reason, condition_reasons::SPEC_VERSION_INVALID);
    }

    #[tokio::test]
    async fn test_pinned_images_come_in_pairs() {
        let store = FakeStore::new();
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.init_image = Some("registry/init:custom".to_string());
        let outcome = validate(&store, s.clone()).await;
        assert_eq!(outcome.condition.status, ConditionStatus::Unknown);
        assert_eq!(outcome.condition.reason, condition_reasons::IMAGE_DEPENDENT_PAIR);

        s.deployment_plan.image = Some("registry/broker:custom".to_string());
        assert!(validate(&store, s).await.is_valid());
    }

    #[tokio::test]
    async fn test_first_failure_short_circuits() {
        // fails the mount, PDB and version checks; only the mount is reported
        let mut s = BrokerClusterSpec::default();
        s.deployment_plan.extra_mounts.secrets = vec!["absent".to_string()];
        s.deployment_plan.pod_disruption_budget = Some(PodDisruptionBudgetSpec {
            selector: Some(PodSelector::default()),
            ..Default::default()
        });
        s.version = Some("0.1".to_string());
        let outcome = validate(&FakeStore::new(), s).await;
        assert_eq!(outcome.condition.reason, condition_reasons::MISSING_RESOURCES);
    }
}
