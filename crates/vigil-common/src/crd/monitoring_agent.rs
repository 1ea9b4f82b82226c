//! MonitoringAgent CRD
//!
//! One MonitoringAgent describes a gateway deployment for a monitoring
//! backend. Each enabled capability (routing, Kubernetes monitoring) becomes
//! its own StatefulSet named `<agent>-<module>`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CapabilitySpec, ImageStatus, ValueSource};
use crate::Error;

/// Repository path of the gateway image on the backend's registry
pub const GATEWAY_IMAGE_PATH: &str = "linux/activegate";

/// Specification for a monitoring agent deployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "vigil.dev",
    version = "v1alpha1",
    kind = "MonitoringAgent",
    plural = "monitoringagents",
    shortname = "ma",
    namespaced,
    status = "MonitoringAgentStatus",
    printcolumn = r#"{"name":"ApiUrl","type":"string","jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.gateway.imageVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringAgentSpec {
    /// Backend API URL (e.g., "https://tenant.example.com/api")
    ///
    /// The host of this URL is the registry serving the gateway image.
    pub api_url: String,

    /// Explicit gateway image repository, overriding the one derived from `apiUrl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_image: Option<String>,

    /// Proxy for gateway connections to the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ValueSource>,

    /// Network zone the gateways belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Routing capability
    #[serde(default)]
    pub routing: CapabilitySpec,

    /// Kubernetes monitoring capability
    #[serde(default)]
    pub kubernetes_monitoring: CapabilitySpec,
}

/// Status of a MonitoringAgent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringAgentStatus {
    /// Gateway image resolved from the registry
    #[serde(default)]
    pub gateway: ImageStatus,
}

impl MonitoringAgentSpec {
    /// Registry host of the backend, taken from `apiUrl`
    pub fn registry_host(&self) -> Option<&str> {
        let rest = self
            .api_url
            .strip_prefix("https://")
            .or_else(|| self.api_url.strip_prefix("http://"))
            .unwrap_or(&self.api_url);
        let host = rest.split('/').next().unwrap_or(rest);
        (!host.is_empty()).then_some(host)
    }

    /// Gateway image repository without tag or digest
    pub fn gateway_repository(&self) -> Option<String> {
        match self.gateway_image.as_deref().filter(|s| !s.is_empty()) {
            Some(image) => Some(image.to_string()),
            None => self
                .registry_host()
                .map(|host| format!("{}/{}", host, GATEWAY_IMAGE_PATH)),
        }
    }

    /// Network zone, if set to a non-empty value
    pub fn network_zone(&self) -> Option<&str> {
        self.network_zone.as_deref().filter(|z| !z.is_empty())
    }
}

impl MonitoringAgent {
    /// Gateway image repository, validated to carry no tag or digest
    ///
    /// Tags are added from the resolved image status, so an explicit
    /// `gatewayImage` must name a bare repository.
    pub fn gateway_repository(&self) -> Result<String, Error> {
        let resource = format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        );
        let repository = self.spec.gateway_repository().ok_or_else(|| {
            Error::configuration(&resource, "no gateway image repository: apiUrl has no host")
        })?;

        let last_segment = repository.rsplit('/').next().unwrap_or(&repository);
        if repository.contains('@') || last_segment.contains(':') {
            return Err(Error::configuration(
                resource,
                format!("gatewayImage {repository} must not carry a tag or digest"),
            ));
        }
        Ok(repository)
    }

    /// Persisted gateway image status, empty until the first resolution
    pub fn image_status(&self) -> ImageStatus {
        self.status
            .as_ref()
            .map(|s| s.gateway.clone())
            .unwrap_or_default()
    }
}
