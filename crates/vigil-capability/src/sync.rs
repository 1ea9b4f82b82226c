//! Create-or-update of derived objects
//!
//! Each object is fetched once and classified against its desired form by
//! fingerprint. At most one write follows; conflicts are surfaced to the
//! caller and retried on the next cycle.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use tracing::{debug, info};

use vigil_common::Error;

use crate::client::{object_key, ClusterClient};
use crate::fingerprint;

/// How a live object relates to its desired form
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No live object exists
    Absent,
    /// Live fingerprint matches the desired one
    Converged,
    /// Live fingerprint differs or is missing
    Stale,
}

impl SyncState {
    /// Classify a live object against the desired metadata
    pub fn classify(live: Option<&ObjectMeta>, desired: &ObjectMeta) -> Self {
        match live {
            None => SyncState::Absent,
            Some(live) if fingerprint::has_changed(live, desired) => SyncState::Stale,
            Some(_) => SyncState::Converged,
        }
    }
}

/// Carry the live object's identity onto the desired object before a replace
fn adopt_identity(live: &ObjectMeta, desired: &mut ObjectMeta) {
    desired.uid = live.uid.clone();
    desired.resource_version = live.resource_version.clone();
    desired.creation_timestamp = live.creation_timestamp.clone();
    if live.owner_references.is_some() {
        desired.owner_references = live.owner_references.clone();
    }
}

fn ensure_persisted(kind: &str, name: &str, meta: &ObjectMeta) -> Result<(), Error> {
    if meta.resource_version.as_deref().is_some_and(|v| !v.is_empty()) {
        Ok(())
    } else {
        Err(Error::internal_with_context(
            "sync",
            format!("{kind} {name} was written but has no resourceVersion"),
        ))
    }
}

/// Object kinds the orchestrator can converge
#[async_trait]
trait SyncTarget: Resource<DynamicType = ()> + Send + Sync + Sized {
    async fn fetch(
        client: &dyn ClusterClient,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Self>, Error>;
    async fn create(client: &dyn ClusterClient, object: &Self) -> Result<Self, Error>;
    async fn update(client: &dyn ClusterClient, object: &Self) -> Result<Self, Error>;
}

#[async_trait]
impl SyncTarget for StatefulSet {
    async fn fetch(
        client: &dyn ClusterClient,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Self>, Error> {
        client.get_statefulset(name, namespace).await
    }

    async fn create(client: &dyn ClusterClient, object: &Self) -> Result<Self, Error> {
        client.create_statefulset(object).await
    }

    async fn update(client: &dyn ClusterClient, object: &Self) -> Result<Self, Error> {
        client.update_statefulset(object).await
    }
}

#[async_trait]
impl SyncTarget for Secret {
    async fn fetch(
        client: &dyn ClusterClient,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Self>, Error> {
        client.get_secret(name, namespace).await
    }

    async fn create(client: &dyn ClusterClient, object: &Self) -> Result<Self, Error> {
        client.create_secret(object).await
    }

    async fn update(client: &dyn ClusterClient, object: &Self) -> Result<Self, Error> {
        client.update_secret(object).await
    }
}

async fn sync<K: SyncTarget>(client: &dyn ClusterClient, mut desired: K) -> Result<bool, Error> {
    let kind = K::kind(&());
    let (name, namespace) = object_key(&kind, desired.meta())?;
    let (name, namespace) = (name.to_string(), namespace.to_string());
    let live = K::fetch(client, &name, &namespace).await?;

    match SyncState::classify(live.as_ref().map(|l| l.meta()), desired.meta()) {
        SyncState::Converged => {
            debug!(%kind, %name, %namespace, "object up to date");
            Ok(false)
        }
        SyncState::Absent => {
            let created = K::create(client, &desired).await?;
            ensure_persisted(&kind, &name, created.meta())?;
            info!(%kind, %name, %namespace, "created object");
            Ok(true)
        }
        SyncState::Stale => {
            if let Some(live) = &live {
                adopt_identity(live.meta(), desired.meta_mut());
            }
            let updated = K::update(client, &desired).await?;
            ensure_persisted(&kind, &name, updated.meta())?;
            info!(%kind, %name, %namespace, "updated object");
            Ok(true)
        }
    }
}

/// Converge a StatefulSet onto its desired form
///
/// Returns whether the store was written.
pub async fn sync_statefulset(
    client: &dyn ClusterClient,
    desired: StatefulSet,
) -> Result<bool, Error> {
    sync(client, desired).await
}

/// Converge a Secret onto its desired form
///
/// Returns whether the store was written.
pub async fn sync_secret(client: &dyn ClusterClient, desired: Secret) -> Result<bool, Error> {
    sync(client, desired).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::testing::FakeCluster;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn desired(hash: &str, replicas: i32) -> StatefulSet {
        let mut meta = ObjectMeta {
            name: Some("agent-routing".to_string()),
            namespace: Some("tenant".to_string()),
            ..Default::default()
        };
        fingerprint::stamp(&mut meta, hash.to_string());
        StatefulSet {
            metadata: meta,
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn classify_by_fingerprint() {
        let want = desired("1", 1).metadata;
        assert_eq!(SyncState::classify(None, &want), SyncState::Absent);
        assert_eq!(SyncState::classify(Some(&want), &want), SyncState::Converged);
        assert_eq!(
            SyncState::classify(Some(&desired("2", 1).metadata), &want),
            SyncState::Stale
        );
        assert_eq!(
            SyncState::classify(Some(&ObjectMeta::default()), &want),
            SyncState::Stale
        );
    }

    #[tokio::test]
    async fn absent_object_is_created_once() {
        let cluster = FakeCluster::new();

        assert!(sync_statefulset(&cluster, desired("1", 1)).await.unwrap());
        assert!(!sync_statefulset(&cluster, desired("1", 1)).await.unwrap());

        assert_eq!(cluster.statefulset_writes(), 1);
        let live = cluster.statefulset("tenant", "agent-routing").unwrap();
        assert_eq!(fingerprint::template_hash(&live.metadata), Some("1"));
    }

    #[tokio::test]
    async fn stale_object_is_replaced_keeping_identity() {
        let cluster = FakeCluster::new();
        let mut live = desired("1", 1);
        live.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "vigil.dev/v1alpha1".to_string(),
            kind: "MonitoringAgent".to_string(),
            name: "agent".to_string(),
            uid: "agent-uid".to_string(),
            ..Default::default()
        }]);
        cluster.insert_statefulset(live);
        let before = cluster.statefulset("tenant", "agent-routing").unwrap();

        assert!(sync_statefulset(&cluster, desired("2", 3)).await.unwrap());

        let after = cluster.statefulset("tenant", "agent-routing").unwrap();
        assert_eq!(fingerprint::template_hash(&after.metadata), Some("2"));
        assert_eq!(after.spec.and_then(|s| s.replicas), Some(3));
        assert_eq!(after.metadata.uid, before.metadata.uid);
        assert_eq!(after.metadata.owner_references, before.metadata.owner_references);
        assert_ne!(after.metadata.resource_version, before.metadata.resource_version);
    }

    #[tokio::test]
    async fn secrets_follow_the_same_rules() {
        let cluster = FakeCluster::new();
        let secret = |hash: &str| {
            let mut meta = ObjectMeta {
                name: Some("agent-routing-custom-properties".to_string()),
                namespace: Some("tenant".to_string()),
                ..Default::default()
            };
            fingerprint::stamp(&mut meta, hash.to_string());
            Secret {
                metadata: meta,
                ..Default::default()
            }
        };

        assert!(sync_secret(&cluster, secret("a")).await.unwrap());
        assert!(!sync_secret(&cluster, secret("a")).await.unwrap());
        assert!(sync_secret(&cluster, secret("b")).await.unwrap());
        assert_eq!(cluster.secret_writes(), 2);
    }

    #[tokio::test]
    async fn secret_replace_keeps_identity_and_checks_persistence() {
        let mut meta = ObjectMeta {
            name: Some("agent-routing-custom-properties".to_string()),
            namespace: Some("tenant".to_string()),
            uid: Some("secret-uid".to_string()),
            resource_version: Some("7".to_string()),
            ..Default::default()
        };
        fingerprint::stamp(&mut meta, "old".to_string());
        let live = Secret {
            metadata: meta,
            ..Default::default()
        };

        let mut client = MockClusterClient::new();
        client
            .expect_get_secret()
            .returning(move |_, _| Ok(Some(live.clone())));
        client
            .expect_update_secret()
            .withf(|s| {
                s.metadata.uid.as_deref() == Some("secret-uid")
                    && s.metadata.resource_version.as_deref() == Some("7")
            })
            .times(1)
            .returning(|s| {
                let mut s = s.clone();
                s.metadata.resource_version = None;
                Ok(s)
            });

        let mut desired = Secret {
            metadata: ObjectMeta {
                name: Some("agent-routing-custom-properties".to_string()),
                namespace: Some("tenant".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        fingerprint::stamp(&mut desired.metadata, "new".to_string());

        let err = sync_secret(&client, desired).await.unwrap_err();
        assert_eq!(err.context(), Some("sync"));
        assert!(err.to_string().contains("Secret agent-routing-custom-properties"));
    }

    #[tokio::test]
    async fn create_without_resource_version_is_internal_error() {
        let mut client = MockClusterClient::new();
        client.expect_get_statefulset().returning(|_, _| Ok(None));
        client
            .expect_create_statefulset()
            .returning(|sts| Ok(sts.clone()));

        let err = sync_statefulset(&client, desired("1", 1)).await.unwrap_err();
        assert_eq!(err.context(), Some("sync"));
    }

    #[tokio::test]
    async fn conflicts_are_surfaced_without_retry() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_statefulset()
            .times(1)
            .returning(|_, _| Ok(Some(desired("old", 1))));
        client
            .expect_update_statefulset()
            .times(1)
            .returning(|_| Err(Error::conflict("StatefulSet", "agent-routing", "modified")));

        let err = sync_statefulset(&client, desired("new", 1)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn nameless_object_is_rejected_before_any_read() {
        let client = MockClusterClient::new();
        let mut sts = desired("1", 1);
        sts.metadata.name = None;
        let err = sync_statefulset(&client, sts).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
