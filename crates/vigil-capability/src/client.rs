//! Cluster access used by the capability pipeline
//!
//! The pipeline only needs a handful of object-store operations. They are
//! collected in [`ClusterClient`] so the reconcile logic can be exercised
//! against a mock or an in-memory store, with [`KubeClusterClient`] as the
//! production implementation.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use vigil_common::crd::{ImageStatus, MonitoringAgent};
use vigil_common::{Error, FIELD_MANAGER, KUBE_SYSTEM_NAMESPACE};

/// Object-store operations needed to reconcile a capability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a StatefulSet, `None` if it does not exist
    async fn get_statefulset(&self, name: &str, namespace: &str)
        -> Result<Option<StatefulSet>, Error>;

    /// Create a StatefulSet; an existing object yields `Error::Conflict`
    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet, Error>;

    /// Replace a StatefulSet; a stale `resourceVersion` yields `Error::Conflict`
    async fn update_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet, Error>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret; an existing object yields `Error::Conflict`
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Replace a Secret; a stale `resourceVersion` yields `Error::Conflict`
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// UID of the kube-system namespace, used as the cluster identity
    async fn kube_system_uid(&self) -> Result<String, Error>;

    /// Write the resolved gateway image into a MonitoringAgent's status
    async fn patch_gateway_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ImageStatus,
    ) -> Result<(), Error>;
}

/// Name and namespace of an object about to be written
pub(crate) fn object_key<'a>(kind: &str, meta: &'a ObjectMeta) -> Result<(&'a str, &'a str), Error> {
    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::validation_for_field("metadata.name", format!("{kind} has no name")))?;
    let namespace = meta
        .namespace
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            Error::validation_for_field("metadata.namespace", format!("{kind} {name} has no namespace"))
        })?;
    Ok((name, namespace))
}

/// Map an API error from a write, turning HTTP 409 into `Error::Conflict`
fn write_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name, ae.message),
        other => other.into(),
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_statefulset(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet, Error> {
        let (name, namespace) = object_key("StatefulSet", &statefulset.metadata)?;
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), statefulset)
            .await
            .map_err(|e| write_error("StatefulSet", name, e))
    }

    async fn update_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet, Error> {
        let (name, namespace) = object_key("StatefulSet", &statefulset.metadata)?;
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &post_params(), statefulset)
            .await
            .map_err(|e| write_error("StatefulSet", name, e))
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let (name, namespace) = object_key("Secret", &secret.metadata)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), secret)
            .await
            .map_err(|e| write_error("Secret", name, e))
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let (name, namespace) = object_key("Secret", &secret.metadata)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &post_params(), secret)
            .await
            .map_err(|e| write_error("Secret", name, e))
    }

    async fn kube_system_uid(&self) -> Result<String, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = api.get(KUBE_SYSTEM_NAMESPACE).await?;
        namespace.metadata.uid.ok_or_else(|| {
            Error::configuration(
                format!("namespace/{KUBE_SYSTEM_NAMESPACE}"),
                "namespace has no UID",
            )
        })
    }

    async fn patch_gateway_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ImageStatus,
    ) -> Result<(), Error> {
        let api: Api<MonitoringAgent> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": { "gateway": status } });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error("MonitoringAgent", name, e))?;
        debug!(agent = %name, namespace = %namespace, "patched gateway image status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_requires_name_and_namespace() {
        let meta = ObjectMeta {
            name: Some("agent-routing".to_string()),
            namespace: Some("tenant".to_string()),
            ..Default::default()
        };
        assert_eq!(object_key("StatefulSet", &meta).unwrap(), ("agent-routing", "tenant"));

        let meta = ObjectMeta {
            name: Some("agent-routing".to_string()),
            ..Default::default()
        };
        let err = object_key("StatefulSet", &meta).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = object_key("Secret", &ObjectMeta::default()).unwrap_err();
        assert!(err.to_string().contains("Secret has no name"));
    }

    #[test]
    fn conflicts_map_to_conflict_errors() {
        let err = write_error(
            "StatefulSet",
            "agent-routing",
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            }),
        );
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());

        let err = write_error(
            "StatefulSet",
            "agent-routing",
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }),
        );
        assert!(matches!(err, Error::Kube { .. }));
    }
}
