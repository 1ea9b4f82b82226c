//! Common types for Vigil: CRDs, errors, and shared constants

#![deny(missing_docs)]

pub mod crd;
pub mod error;

pub use error::Error;

/// Namespace whose UID identifies the cluster
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Field manager name used for writes made by the operator
pub const FIELD_MANAGER: &str = "vigil-operator";

/// API version of the MonitoringAgent CRD, used in owner references
pub const AGENT_API_VERSION: &str = "vigil.dev/v1alpha1";

/// Kind of the MonitoringAgent CRD, used in owner references
pub const AGENT_KIND: &str = "MonitoringAgent";
