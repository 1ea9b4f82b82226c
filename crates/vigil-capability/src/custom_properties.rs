//! Custom gateway configuration
//!
//! A capability may carry a custom-properties document, either inline or as
//! a reference to an existing Secret. Inline documents are materialized into
//! an owned Secret named `<agent>-<owner>-custom-properties`. In both cases the
//! content is hashed so that editing it changes the StatefulSet fingerprint.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::debug;

use vigil_common::crd::{resolve_source, MonitoringAgent, ResolvedSource, ValueSource};
use vigil_common::Error;

use crate::client::{object_key, ClusterClient};
use crate::{fingerprint, owner_reference, sync};

/// Secret data key holding the document
pub const DATA_KEY: &str = "customProperties";
/// File name of the document inside the volume
pub const DATA_PATH: &str = "custom.properties";
/// Name of the pod volume
pub const VOLUME_NAME: &str = "custom-properties";
/// Where the gateway reads the document
pub const MOUNT_PATH: &str = "/var/lib/gateway/config_template/custom.properties";
/// Suffix of materialized Secret names
pub const SUFFIX: &str = "custom-properties";

/// Name of the Secret materialized for an inline document
pub fn secret_name(agent_name: &str, owner: &str) -> String {
    format!("{agent_name}-{owner}-{SUFFIX}")
}

/// Secret the pod mounts, or `None` if no document is configured
pub fn mounted_secret_name(
    agent_name: &str,
    owner: &str,
    source: Option<&ValueSource>,
) -> Option<String> {
    match resolve_source(source)? {
        ResolvedSource::SecretRef(name) => Some(name.to_string()),
        ResolvedSource::Inline(_) => Some(secret_name(agent_name, owner)),
    }
}

/// Build the owned Secret for an inline document, fingerprint included
pub fn build_secret(agent: &MonitoringAgent, owner: &str, value: &str) -> Result<Secret, Error> {
    let (name, namespace) = object_key("MonitoringAgent", &agent.metadata)?;

    let mut secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(name, owner)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            DATA_KEY.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    let hash = fingerprint::fingerprint(&secret)?;
    fingerprint::stamp(&mut secret.metadata, hash);
    secret.metadata.owner_references = Some(vec![owner_reference(agent)?]);
    Ok(secret)
}

/// Make sure the custom-properties document is in place and hash its content
///
/// Returns an empty string when no document is configured.
pub async fn reconcile_custom_properties(
    client: &dyn ClusterClient,
    agent: &MonitoringAgent,
    owner: &str,
    source: Option<&ValueSource>,
) -> Result<String, Error> {
    match resolve_source(source) {
        None => Ok(String::new()),
        Some(ResolvedSource::Inline(value)) => {
            let secret = build_secret(agent, owner, value)?;
            sync::sync_secret(client, secret).await?;
            Ok(fingerprint::content_hash(value.as_bytes()))
        }
        Some(ResolvedSource::SecretRef(secret_name)) => {
            let (_, namespace) = object_key("MonitoringAgent", &agent.metadata)?;
            let secret = client
                .get_secret(secret_name, namespace)
                .await?
                .ok_or_else(|| Error::not_found("Secret", namespace, secret_name))?;
            let content = secret
                .data
                .as_ref()
                .and_then(|d| d.get(DATA_KEY))
                .ok_or_else(|| {
                    Error::configuration(
                        format!("{namespace}/{secret_name}"),
                        format!("secret has no '{DATA_KEY}' key"),
                    )
                })?;
            debug!(secret = %secret_name, namespace = %namespace, "read referenced custom properties");
            Ok(fingerprint::content_hash(&content.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeCluster};

    const OWNER: &str = "routing";

    fn referenced_secret(name: &str, data: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("tenant".to_string()),
                ..Default::default()
            },
            data: data.map(|d| {
                BTreeMap::from([(DATA_KEY.to_string(), ByteString(d.as_bytes().to_vec()))])
            }),
            ..Default::default()
        }
    }

    #[test]
    fn mounted_secret_follows_the_source() {
        assert_eq!(mounted_secret_name("agent", OWNER, None), None);
        assert_eq!(
            mounted_secret_name("agent", OWNER, Some(&ValueSource::inline("x"))).as_deref(),
            Some("agent-routing-custom-properties")
        );
        assert_eq!(
            mounted_secret_name("agent", OWNER, Some(&ValueSource::secret_ref("props"))).as_deref(),
            Some("props")
        );
        assert_eq!(
            mounted_secret_name("agent", OWNER, Some(&ValueSource::default())),
            None
        );
    }

    #[test]
    fn built_secret_is_owned_and_fingerprinted() {
        let agent = testing::agent();
        let secret = build_secret(&agent, OWNER, "a=b").unwrap();

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("agent-routing-custom-properties")
        );
        assert_eq!(secret.metadata.namespace.as_deref(), Some("tenant"));
        assert_eq!(
            secret.data.as_ref().and_then(|d| d.get(DATA_KEY)),
            Some(&ByteString(b"a=b".to_vec()))
        );
        assert!(fingerprint::template_hash(&secret.metadata).is_some());
        let owners = secret.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].name, "agent");
        assert_eq!(owners[0].controller, Some(true));

        let again = build_secret(&agent, OWNER, "a=b").unwrap();
        let other = build_secret(&agent, OWNER, "a=c").unwrap();
        assert!(!fingerprint::has_changed(&again.metadata, &secret.metadata));
        assert!(fingerprint::has_changed(&secret.metadata, &other.metadata));
    }

    #[tokio::test]
    async fn unset_source_hashes_to_empty() {
        let cluster = FakeCluster::new();
        let hash = reconcile_custom_properties(&cluster, &testing::agent(), OWNER, None)
            .await
            .unwrap();
        assert_eq!(hash, "");
        assert_eq!(cluster.secret_writes(), 0);
    }

    #[tokio::test]
    async fn inline_value_is_materialized_once() {
        let cluster = FakeCluster::new();
        let agent = testing::agent();
        let source = ValueSource::inline("a=b");

        let first = reconcile_custom_properties(&cluster, &agent, OWNER, Some(&source))
            .await
            .unwrap();
        let second = reconcile_custom_properties(&cluster, &agent, OWNER, Some(&source))
            .await
            .unwrap();

        assert_eq!(first, fingerprint::content_hash(b"a=b"));
        assert_eq!(first, second);
        assert_eq!(cluster.secret_writes(), 1);
        assert!(cluster
            .secret("tenant", "agent-routing-custom-properties")
            .is_some());
    }

    #[tokio::test]
    async fn referenced_secret_content_is_hashed() {
        let cluster = FakeCluster::new();
        cluster.insert_secret(referenced_secret("props", Some("x=1")));

        let hash = reconcile_custom_properties(
            &cluster,
            &testing::agent(),
            OWNER,
            Some(&ValueSource::secret_ref("props")),
        )
        .await
        .unwrap();

        assert_eq!(hash, fingerprint::content_hash(b"x=1"));
        assert_eq!(cluster.secret_writes(), 0);
    }

    #[tokio::test]
    async fn reference_wins_over_inline_value() {
        let cluster = FakeCluster::new();
        cluster.insert_secret(referenced_secret("props", Some("x=1")));
        let source = ValueSource {
            value: Some("inline".to_string()),
            value_from: Some("props".to_string()),
        };

        let hash = reconcile_custom_properties(&cluster, &testing::agent(), OWNER, Some(&source))
            .await
            .unwrap();

        assert_eq!(hash, fingerprint::content_hash(b"x=1"));
        assert!(cluster
            .secret("tenant", "agent-routing-custom-properties")
            .is_none());
    }

    #[tokio::test]
    async fn missing_referenced_secret_is_not_found() {
        let cluster = FakeCluster::new();
        let err = reconcile_custom_properties(
            &cluster,
            &testing::agent(),
            OWNER,
            Some(&ValueSource::secret_ref("missing")),
        )
        .await
        .unwrap_err();

        assert!(err.is_not_found());
        assert!(err.to_string().contains("tenant/missing"));
    }

    #[tokio::test]
    async fn referenced_secret_without_key_is_configuration_error() {
        let cluster = FakeCluster::new();
        cluster.insert_secret(referenced_secret("props", None));

        let err = reconcile_custom_properties(
            &cluster,
            &testing::agent(),
            OWNER,
            Some(&ValueSource::secret_ref("props")),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Configuration { .. }));
    }
}
