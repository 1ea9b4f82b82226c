//! Capability reconciliation for Vigil gateways
//!
//! Each capability of a `MonitoringAgent` is deployed as its own StatefulSet.
//! A reconcile cycle resolves the gateway image, materializes custom
//! configuration, builds the desired StatefulSet and converges the live object
//! onto it. Drift is detected solely by comparing content fingerprints.

#![deny(missing_docs)]

pub mod capability;
pub mod client;
pub mod custom_properties;
pub mod fingerprint;
pub mod reconciler;
pub mod registry;
pub mod statefulset;
pub mod sync;
pub mod version;

#[cfg(test)]
mod testing;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use vigil_common::crd::MonitoringAgent;
use vigil_common::{Error, AGENT_API_VERSION, AGENT_KIND};

pub use capability::{Capability, CapabilityKind};
pub use client::{ClusterClient, KubeClusterClient};
pub use reconciler::CapabilityReconciler;
pub use registry::{HttpRegistryClient, RegistryClient};

/// Controller reference from a derived object to its agent
pub fn owner_reference(agent: &MonitoringAgent) -> Result<OwnerReference, Error> {
    let name = agent
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::validation_for_field("metadata.name", "MonitoringAgent has no name"))?;
    let uid = agent
        .metadata
        .uid
        .clone()
        .ok_or_else(|| {
            Error::validation_for_field("metadata.uid", format!("MonitoringAgent {name} has no UID"))
        })?;

    Ok(OwnerReference {
        api_version: AGENT_API_VERSION.to_string(),
        kind: AGENT_KIND.to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}
