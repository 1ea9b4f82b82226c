//! Supporting types for the MonitoringAgent CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A value given inline or by reference to a Secret in the agent's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueSource {
    /// Inline value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Name of an existing Secret holding the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// Where a [`ValueSource`] actually takes its value from
///
/// A secret reference takes precedence over an inline value when both are set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedSource<'a> {
    /// Inline value
    Inline(&'a str),
    /// Name of the referenced Secret
    SecretRef(&'a str),
}

impl ValueSource {
    /// Create an inline value source
    pub fn inline(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            value_from: None,
        }
    }

    /// Create a secret-reference value source
    pub fn secret_ref(name: impl Into<String>) -> Self {
        Self {
            value: None,
            value_from: Some(name.into()),
        }
    }

    /// Resolve which source is in effect; empty strings count as unset
    pub fn resolve(&self) -> Option<ResolvedSource<'_>> {
        fn non_empty(s: &Option<String>) -> Option<&str> {
            s.as_deref().filter(|v| !v.is_empty())
        }

        if let Some(name) = non_empty(&self.value_from) {
            Some(ResolvedSource::SecretRef(name))
        } else {
            non_empty(&self.value).map(ResolvedSource::Inline)
        }
    }
}

/// Resolve an optional value source, treating `None` and empty as unset
pub fn resolve_source(source: Option<&ValueSource>) -> Option<ResolvedSource<'_>> {
    source.and_then(ValueSource::resolve)
}

/// Per-capability deployment settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySpec {
    /// Whether this capability is deployed
    #[serde(default)]
    pub enabled: bool,

    /// Number of gateway replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Node selector for gateway pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for gateway pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Extra environment variables, appended after the built-in ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Extra process arguments, appended after the enable flag
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Custom gateway configuration mounted into the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<ValueSource>,

    /// Gateway group name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Service account override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra labels for the StatefulSet and its pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Image metadata resolved from the registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Version reported by the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,

    /// Content digest of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_hash: Option<String>,
}
