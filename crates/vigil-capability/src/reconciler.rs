//! Per-capability reconcile cycle

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, instrument};

use vigil_common::crd::MonitoringAgent;
use vigil_common::Error;

use crate::capability::Capability;
use crate::client::ClusterClient;
use crate::custom_properties::reconcile_custom_properties;
use crate::owner_reference;
use crate::registry::RegistryClient;
use crate::statefulset::{build_statefulset, StatefulSetProperties};
use crate::sync::sync_statefulset;
use crate::version::VersionResolver;

/// Drives one capability of an agent toward its desired state
pub struct CapabilityReconciler {
    cluster: Arc<dyn ClusterClient>,
    versions: VersionResolver,
    capability: Capability,
}

impl CapabilityReconciler {
    /// Create a reconciler for one capability
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<dyn RegistryClient>,
        capability: Capability,
        enable_updates: bool,
    ) -> Self {
        Self {
            versions: VersionResolver::new(cluster.clone(), registry, enable_updates),
            cluster,
            capability,
        }
    }

    /// The capability this reconciler manages
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Run one cycle: resolve the image, materialize custom properties,
    /// build the StatefulSet and sync it
    ///
    /// Returns whether anything changed (image status or StatefulSet). The
    /// first failing step aborts the cycle; nothing is rolled back.
    #[instrument(skip(self, agent), fields(agent = %agent.name_any(), capability = %self.capability.kind))]
    pub async fn reconcile(&self, agent: &mut MonitoringAgent) -> Result<bool, Error> {
        let version_changed = self.versions.update_image_version(agent).await?;

        let cluster_uid = self.cluster.kube_system_uid().await?;

        let custom_properties_hash = reconcile_custom_properties(
            self.cluster.as_ref(),
            agent,
            self.capability.service_account_owner,
            self.capability.spec(&agent.spec).custom_properties.as_ref(),
        )
        .await?;

        let mut desired = build_statefulset(&StatefulSetProperties {
            agent,
            capability: &self.capability,
            cluster_uid: &cluster_uid,
            custom_properties_hash: &custom_properties_hash,
        })?;
        desired.metadata.owner_references = Some(vec![owner_reference(agent)?]);

        let object_changed = sync_statefulset(self.cluster.as_ref(), desired).await?;
        debug!(version_changed, object_changed, "capability reconciled");
        Ok(version_changed || object_changed)
    }
}
