//! Gateway image version tracking
//!
//! When updates are enabled, each cycle resolves the floating gateway image
//! against the registry and records its version and digest in the agent's
//! status. The builder pins the image to that digest, so a new upstream
//! release flows into the StatefulSet fingerprint and rolls the pods.

use std::sync::Arc;

use tracing::{debug, info};

use vigil_common::crd::{ImageStatus, MonitoringAgent, MonitoringAgentStatus};
use vigil_common::Error;

use crate::client::{object_key, ClusterClient};
use crate::registry::{DockerConfig, ImageReference, RegistryClient};

/// Suffix of the agent's image pull secret
pub const PULL_SECRET_SUFFIX: &str = "-pull-secret";

/// Key of the docker config document in the pull secret
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// Tag resolved when looking for new gateway releases
pub const FLOATING_TAG: &str = "latest";

/// Name of the agent's image pull secret
pub fn pull_secret_name(agent_name: &str) -> String {
    format!("{agent_name}{PULL_SECRET_SUFFIX}")
}

/// Resolves the gateway image and records it in the agent status
pub struct VersionResolver {
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<dyn RegistryClient>,
    enable_updates: bool,
}

impl VersionResolver {
    /// Create a resolver; with `enable_updates` off it never contacts the registry
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<dyn RegistryClient>,
        enable_updates: bool,
    ) -> Self {
        Self {
            cluster,
            registry,
            enable_updates,
        }
    }

    /// Refresh the agent's gateway image status
    ///
    /// Returns `true` only if the resolved version or digest differs from the
    /// persisted one and the status was written. On any failure the status is
    /// left untouched.
    pub async fn update_image_version(&self, agent: &mut MonitoringAgent) -> Result<bool, Error> {
        if !self.enable_updates {
            return Ok(false);
        }

        let (name, namespace) = object_key("MonitoringAgent", &agent.metadata)?;
        let (name, namespace) = (name.to_string(), namespace.to_string());

        let docker_config = self.docker_config(&name, &namespace).await?;

        let repository = agent.gateway_repository()?;
        let image: ImageReference = format!("{repository}:{FLOATING_TAG}").parse()?;
        let credentials = docker_config.credentials_for(&image.registry);
        if credentials.is_none() {
            debug!(registry = %image.registry, "no pull credentials for registry, resolving anonymously");
        }

        let resolved: ImageStatus = self.registry.resolve(&image, credentials).await?.into();
        if resolved == agent.image_status() {
            debug!(agent = %name, "gateway image unchanged");
            return Ok(false);
        }

        self.cluster
            .patch_gateway_status(&name, &namespace, &resolved)
            .await?;
        info!(
            agent = %name,
            version = resolved.image_version.as_deref().unwrap_or_default(),
            digest = resolved.image_hash.as_deref().unwrap_or_default(),
            "gateway image updated"
        );
        agent
            .status
            .get_or_insert_with(MonitoringAgentStatus::default)
            .gateway = resolved;
        Ok(true)
    }

    async fn docker_config(&self, name: &str, namespace: &str) -> Result<DockerConfig, Error> {
        let secret_name = pull_secret_name(name);
        let resource = format!("{namespace}/{secret_name}");

        let secret = self
            .cluster
            .get_secret(&secret_name, namespace)
            .await?
            .ok_or_else(|| Error::configuration(&resource, "pull secret not found"))?;
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_KEY))
            .ok_or_else(|| {
                Error::configuration(&resource, format!("secret has no '{DOCKER_CONFIG_KEY}' key"))
            })?;
        DockerConfig::parse(&data.0).map_err(|e| {
            Error::configuration(&resource, format!("malformed docker config: {e}"))
        })
    }
}
