//! Broker management client
//!
//! Addresses and queues live inside the brokers, so the operator manages them
//! through each replica's management endpoint. [`ManagementClient`] is the
//! seam the synchronizer talks to; [`HttpManagementClient`] sends JSON "exec"
//! requests over HTTP(S).

use crate::config::OperatorConfig;
use crate::crd::BrokerAddressSpec;
use crate::error::{OperatorError, Result};
use crate::targets::ReplicaTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Routing type used when neither the queue nor the address declares one
pub const DEFAULT_ROUTING_TYPE: &str = "MULTICAST";

/// Broker name used in management object names
const BROKER_NAME: &str = "broker";

/// Path of the management endpoint on every replica
const MANAGEMENT_PATH: &str = "/console/jolokia";

/// Error code reported when an address already exists
const ADDRESS_EXISTS_CODE: &str = "AMQ229204";

/// Error code reported when a queue already exists
const QUEUE_EXISTS_CODE: &str = "AMQ229019";

/// Error code reported when deleting an address the broker does not have
const ADDRESS_MISSING_CODE: &str = "AMQ229203";

/// Error code reported when destroying a queue the broker does not have
const QUEUE_MISSING_CODE: &str = "AMQ229017";

/// Structured creation or deletion failure reported by a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationError {
    AddressAlreadyExists,
    QueueAlreadyExists,
    AddressDoesNotExist,
    QueueDoesNotExist,
}

impl CreationError {
    /// Recognise a structured failure from the broker's error text
    pub fn from_message(message: &str) -> Option<Self> {
        [
            (ADDRESS_EXISTS_CODE, Self::AddressAlreadyExists),
            (QUEUE_EXISTS_CODE, Self::QueueAlreadyExists),
            (ADDRESS_MISSING_CODE, Self::AddressDoesNotExist),
            (QUEUE_MISSING_CODE, Self::QueueDoesNotExist),
        ]
        .into_iter()
        .find_map(|(code, error)| message.contains(code).then_some(error))
    }
}

/// How a management call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    /// Connection or protocol failure before the broker answered
    Transport,
    /// No answer within the operation timeout
    Timeout,
    /// The broker rejected the operation
    Remote,
}

/// Failed management call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed ({kind:?}): {message}")]
pub struct CallError {
    pub operation: String,
    pub kind: CallErrorKind,
    pub message: String,
    pub creation_error: Option<CreationError>,
}

impl CallError {
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            operation: operation.into(),
            kind: CallErrorKind::Remote,
            creation_error: CreationError::from_message(&message),
            message,
        }
    }

    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind: CallErrorKind::Transport,
            message: message.into(),
            creation_error: None,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self {
            operation: operation.into(),
            kind: CallErrorKind::Timeout,
            message: format!("no response after {}", humantime::format_duration(after)),
            creation_error: None,
        }
    }

    /// Failure expected to clear without a spec change
    pub fn is_transient(&self) -> bool {
        self.kind != CallErrorKind::Remote
    }

    pub fn is(&self, creation_error: CreationError) -> bool {
        self.creation_error == Some(creation_error)
    }
}

impl From<CallError> for OperatorError {
    fn from(err: CallError) -> Self {
        match err.kind {
            CallErrorKind::Timeout => OperatorError::Timeout(err.to_string()),
            CallErrorKind::Transport => OperatorError::NoManagementClient(err.to_string()),
            CallErrorKind::Remote => OperatorError::UnknownManagement(err.to_string()),
        }
    }
}

/// Payload returned by a successful management call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagementResponse {
    pub value: Value,
}

impl ManagementResponse {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Whether a `listBindingsForAddress` answer names any binding
    pub fn has_bindings(&self) -> bool {
        match &self.value {
            Value::Null => false,
            Value::String(s) => {
                let s = s.trim();
                !(s.is_empty() || s == "[]")
            }
            Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }
}

pub type CallResult = std::result::Result<ManagementResponse, CallError>;

/// Remote management operations on one broker replica
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn create_address(&self, name: &str, routing_type: &str) -> CallResult;

    async fn delete_address(&self, name: &str) -> CallResult;

    /// Create a queue from its JSON configuration
    async fn create_queue_from_config(&self, config: &str, ignore_if_exists: bool) -> CallResult;

    async fn update_queue(&self, config: &str) -> CallResult;

    async fn delete_queue(&self, name: &str) -> CallResult;

    async fn list_bindings_for_address(&self, address: &str) -> CallResult;
}

/// Creates a management client for a replica target
pub trait ManagementConnector: Send + Sync {
    fn connect(&self, target: &ReplicaTarget) -> Arc<dyn ManagementClient>;
}

/// Configuration for management clients
#[derive(Debug, Clone)]
pub struct ManagementClientConfig {
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Operation timeout
    pub operation_timeout: Duration,
    /// Management port on every replica
    pub port: u16,
    /// Extra CA bundle (PEM) for HTTPS endpoints
    pub ca_cert: Option<PathBuf>,
    /// Accept any server certificate
    pub insecure_skip_verify: bool,
}

impl Default for ManagementClientConfig {
    fn default() -> Self {
        OperatorConfig::default().into()
    }
}

impl From<OperatorConfig> for ManagementClientConfig {
    fn from(config: OperatorConfig) -> Self {
        Self {
            connection_timeout: config.management_connect_timeout,
            operation_timeout: config.management_timeout,
            port: config.management_port,
            ca_cert: config.management_ca_cert,
            insecure_skip_verify: config.management_insecure,
        }
    }
}

/// Connector producing [`HttpManagementClient`]s sharing one HTTP pool
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    config: ManagementClientConfig,
}

impl HttpConnector {
    pub fn new(config: ManagementClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connection_timeout);

        if let Some(ref ca_path) = config.ca_cert {
            let pem = std::fs::read(ca_path).map_err(|e| {
                OperatorError::InvalidConfig(format!(
                    "Failed to read CA certificate {}: {}",
                    ca_path.display(),
                    e
                ))
            })?;
            let ca_cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                OperatorError::InvalidConfig(format!("Failed to parse CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(ca_cert);
        }

        if config.insecure_skip_verify {
            warn!("Certificate verification disabled for broker management endpoints");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| OperatorError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }
}

impl ManagementConnector for HttpConnector {
    fn connect(&self, target: &ReplicaTarget) -> Arc<dyn ManagementClient> {
        Arc::new(HttpManagementClient {
            http: self.http.clone(),
            url: format!(
                "{}://{}:{}{}",
                target.credentials.protocol, target.fqdn, self.config.port, MANAGEMENT_PATH
            ),
            user: target.credentials.user.clone(),
            password: target.credentials.password.clone(),
            operation_timeout: self.config.operation_timeout,
        })
    }
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    mbean: String,
    operation: &'a str,
    arguments: Vec<Value>,
}

#[derive(Deserialize)]
struct ExecResponse {
    status: u16,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Management client for a single replica
pub struct HttpManagementClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    operation_timeout: Duration,
}

impl HttpManagementClient {
    async fn exec(&self, operation: &str, arguments: Vec<Value>) -> CallResult {
        let request = ExecRequest {
            type_: "exec",
            mbean: format!("org.apache.activemq.artemis:broker=\"{}\"", BROKER_NAME),
            operation,
            arguments,
        };

        debug!(url = %self.url, operation = %operation, "Sending management request");

        let send = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send();

        let response = timeout(self.operation_timeout, send)
            .await
            .map_err(|_| CallError::timeout(operation, self.operation_timeout))?
            .map_err(|e| CallError::transport(operation, e.to_string()))?;

        let http_status = response.status();
        if let Some(err) = classify_status(operation, http_status) {
            return Err(err);
        }

        let body: ExecResponse = timeout(self.operation_timeout, response.json())
            .await
            .map_err(|_| CallError::timeout(operation, self.operation_timeout))?
            .map_err(|e| CallError::transport(operation, e.to_string()))?;

        if body.status == 200 {
            Ok(ManagementResponse::new(body.value))
        } else {
            Err(CallError::remote(
                operation,
                body.error
                    .unwrap_or_else(|| format!("status {}", body.status)),
            ))
        }
    }
}

/// Map a failed HTTP status to a call error; 5xx answers are retried like
/// connection failures
fn classify_status(operation: &str, status: reqwest::StatusCode) -> Option<CallError> {
    if status.is_server_error() {
        Some(CallError::transport(operation, format!("HTTP {}", status)))
    } else if status.is_client_error() {
        Some(CallError::remote(operation, format!("HTTP {}", status)))
    } else {
        None
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn create_address(&self, name: &str, routing_type: &str) -> CallResult {
        self.exec(
            "createAddress(java.lang.String,java.lang.String)",
            vec![name.into(), routing_type.into()],
        )
        .await
    }

    async fn delete_address(&self, name: &str) -> CallResult {
        self.exec("deleteAddress(java.lang.String)", vec![name.into()])
            .await
    }

    async fn create_queue_from_config(&self, config: &str, ignore_if_exists: bool) -> CallResult {
        self.exec(
            "createQueue(java.lang.String,boolean)",
            vec![config.into(), ignore_if_exists.into()],
        )
        .await
    }

    async fn update_queue(&self, config: &str) -> CallResult {
        self.exec("updateQueue(java.lang.String)", vec![config.into()])
            .await
    }

    async fn delete_queue(&self, name: &str) -> CallResult {
        self.exec("destroyQueue(java.lang.String)", vec![name.into()])
            .await
    }

    async fn list_bindings_for_address(&self, address: &str) -> CallResult {
        self.exec(
            "listBindingsForAddress(java.lang.String)",
            vec![address.into()],
        )
        .await
    }
}

/// Queue configuration as sent to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePayload {
    /// JSON document with kebab-case keys
    pub config: String,
    pub ignore_if_exists: bool,
}

/// Build the queue configuration for a declaration that names a queue
///
/// The routing type falls back to the address routing type and then to
/// `MULTICAST`; `configuration-managed` defaults to true.
pub fn queue_payload(spec: &BrokerAddressSpec) -> Result<Option<QueuePayload>> {
    let Some(queue) = spec.queue() else {
        return Ok(None);
    };

    let mut config = spec.queue_configuration.clone().unwrap_or_default();
    if config.routing_type.is_none() {
        config.routing_type = Some(
            spec.routing_type
                .clone()
                .unwrap_or_else(|| DEFAULT_ROUTING_TYPE.to_string()),
        );
    }
    config.configuration_managed.get_or_insert(true);
    let ignore_if_exists = config.ignore_if_exists.take().unwrap_or(false);

    let mut fields = serde_json::Map::new();
    fields.insert("name".to_string(), queue.into());
    fields.insert("address".to_string(), spec.address_name.clone().into());
    if let Value::Object(declared) = serde_json::to_value(&config)? {
        for (key, value) in declared {
            fields.insert(kebab_case(&key), value);
        }
    }

    Ok(Some(QueuePayload {
        config: serde_json::to_string(&Value::Object(fields))?,
        ignore_if_exists,
    }))
}

fn kebab_case(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for c in camel.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::QueueConfiguration;

    fn address_spec(queue: Option<&str>, routing: Option<&str>) -> BrokerAddressSpec {
        BrokerAddressSpec {
            address_name: "orders".to_string(),
            queue_name: queue.map(str::to_string),
            routing_type: routing.map(str::to_string),
            ..Default::default()
        }
    }

    fn parse(payload: &QueuePayload) -> Value {
        serde_json::from_str(&payload.config).unwrap()
    }

    #[test]
    fn test_creation_error_codes() {
        assert_eq!(
            CreationError::from_message("AMQ229204: Address already exists"),
            Some(CreationError::AddressAlreadyExists)
        );
        assert_eq!(
            CreationError::from_message("ActiveMQQueueExistsException[errorType=QUEUE_EXISTS message=AMQ229019"),
            Some(CreationError::QueueAlreadyExists)
        );
        assert_eq!(
            CreationError::from_message("AMQ229203: Address Does Not Exist: orders"),
            Some(CreationError::AddressDoesNotExist)
        );
        assert_eq!(
            CreationError::from_message("AMQ229017: Queue orders.q does not exist"),
            Some(CreationError::QueueDoesNotExist)
        );
        assert_eq!(CreationError::from_message("something else"), None);
    }

    #[test]
    fn test_call_error_classification() {
        let remote = CallError::remote("createQueue", "AMQ229019 exists");
        assert!(remote.is(CreationError::QueueAlreadyExists));
        assert!(!remote.is_transient());
        assert!(!OperatorError::from(remote).requeue());

        let transport = CallError::transport("createQueue", "connection refused");
        assert!(transport.is_transient());
        assert!(OperatorError::from(transport).requeue());

        let timed_out = CallError::timeout("createQueue", Duration::from_secs(30));
        assert!(timed_out.message.contains("30s"));
        assert!(matches!(
            OperatorError::from(timed_out),
            OperatorError::Timeout(_)
        ));
    }

    #[test]
    fn test_has_bindings() {
        assert!(!ManagementResponse::default().has_bindings());
        assert!(!ManagementResponse::new("").has_bindings());
        assert!(!ManagementResponse::new("[]").has_bindings());
        assert!(!ManagementResponse::new(Vec::<Value>::new()).has_bindings());
        assert!(ManagementResponse::new("[QueueBinding orders.q]").has_bindings());
    }

    #[test]
    fn test_queue_payload_none_without_queue() {
        assert!(queue_payload(&address_spec(None, None)).unwrap().is_none());
        assert!(queue_payload(&address_spec(Some(""), None))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_queue_payload_inherits_address_routing() {
        let payload = queue_payload(&address_spec(Some("orders.q"), Some("ANYCAST")))
            .unwrap()
            .unwrap();
        let json = parse(&payload);
        assert_eq!(json["name"], "orders.q");
        assert_eq!(json["address"], "orders");
        assert_eq!(json["routing-type"], "ANYCAST");
        assert_eq!(json["configuration-managed"], true);
        assert!(!payload.ignore_if_exists);
    }

    #[test]
    fn test_queue_payload_defaults_to_multicast() {
        let payload = queue_payload(&address_spec(Some("orders.q"), None))
            .unwrap()
            .unwrap();
        assert_eq!(parse(&payload)["routing-type"], "MULTICAST");
    }

    #[test]
    fn test_queue_payload_keeps_declared_config() {
        let mut spec = address_spec(Some("orders.q"), Some("ANYCAST"));
        spec.queue_configuration = Some(QueueConfiguration {
            routing_type: Some("MULTICAST".to_string()),
            max_consumers: Some(5),
            configuration_managed: Some(false),
            ignore_if_exists: Some(true),
            ..Default::default()
        });
        let payload = queue_payload(&spec).unwrap().unwrap();
        let json = parse(&payload);
        assert_eq!(json["routing-type"], "MULTICAST");
        assert_eq!(json["max-consumers"], 5);
        assert_eq!(json["configuration-managed"], false);
        assert!(json.get("ignore-if-exists").is_none());
        assert!(payload.ignore_if_exists);
    }

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab_case("autoDeleteMessageCount"), "auto-delete-message-count");
        assert_eq!(kebab_case("durable"), "durable");
    }

    #[test]
    fn test_client_config_from_operator_config() {
        let config = ManagementClientConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.operation_timeout, Duration::from_secs(30));
        assert_eq!(config.port, 8161);
        assert!(config.ca_cert.is_none());
        assert!(!config.insecure_skip_verify);
    }

    #[test]
    fn test_server_errors_are_transient() {
        use reqwest::StatusCode;

        let unavailable =
            classify_status("createAddress", StatusCode::SERVICE_UNAVAILABLE).unwrap();
        assert_eq!(unavailable.kind, CallErrorKind::Transport);
        assert!(OperatorError::from(unavailable).requeue());

        let forbidden = classify_status("createAddress", StatusCode::FORBIDDEN).unwrap();
        assert_eq!(forbidden.kind, CallErrorKind::Remote);
        assert!(!forbidden.is_transient());

        assert!(classify_status("createAddress", StatusCode::OK).is_none());
    }

    #[test]
    fn test_connector_requires_readable_ca() {
        let config = ManagementClientConfig {
            ca_cert: Some(PathBuf::from("/nonexistent/broker-ca.pem")),
            ..Default::default()
        };
        let err = HttpConnector::new(config).err().unwrap();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
        assert!(err.to_string().contains("broker-ca.pem"));
    }

    #[test]
    fn test_connector_verifies_by_default() {
        assert!(HttpConnector::new(ManagementClientConfig::default()).is_ok());
        let insecure = ManagementClientConfig {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(HttpConnector::new(insecure).is_ok());
    }
}
