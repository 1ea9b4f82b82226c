//! Desired StatefulSet construction
//!
//! The manifest is a pure function of the agent, the capability descriptor,
//! the cluster identity and the custom-properties hash. Identical inputs give
//! a byte-identical manifest and therefore an identical fingerprint.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, EnvVarSource, HTTPGetAction, KeyToPath, LocalObjectReference,
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
    PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use vigil_common::crd::{resolve_source, ImageStatus, MonitoringAgent, ResolvedSource};
use vigil_common::Error;

use crate::capability::Capability;
use crate::client::object_key;
use crate::{custom_properties, fingerprint, version};

/// Name of the gateway container
pub const CONTAINER_NAME: &str = "gateway";
/// HTTPS port served by the gateway
pub const GATEWAY_PORT: i32 = 9999;

/// Label naming the component, shared by every capability
pub const COMPONENT_LABEL: &str = "vigil.dev/component";
/// Label naming the owning agent
pub const INSTANCE_LABEL: &str = "vigil.dev/instance";
/// Label naming the capability module, on the StatefulSet only
pub const MODULE_LABEL: &str = "module";
const COMPONENT_VALUE: &str = "gateway";

/// Pod annotation recording the resolved image version
pub const IMAGE_VERSION_ANNOTATION: &str = "internal.vigil.dev/image-version";
/// Pod annotation recording the resolved image digest
pub const IMAGE_HASH_ANNOTATION: &str = "internal.vigil.dev/image-hash";
/// Pod annotation recording the custom-properties content hash
pub const CUSTOM_PROPERTIES_HASH_ANNOTATION: &str = "internal.vigil.dev/custom-properties-hash";

/// Environment variable carrying the capability token
pub const ENV_CAPABILITIES: &str = "DT_CAPABILITIES";
/// Environment variable carrying the agent namespace
pub const ENV_ID_SEED_NAMESPACE: &str = "DT_ID_SEED_NAMESPACE";
/// Environment variable carrying the cluster identity
pub const ENV_ID_SEED_CLUSTER_ID: &str = "DT_ID_SEED_K8S_CLUSTER_ID";
/// Environment variable carrying the proxy
pub const ENV_PROXY: &str = "ACTIVE_GATE_PROXY";
/// Key read from a proxy secret
pub const PROXY_SECRET_KEY: &str = "proxy";

const ARG_ENABLE: &str = "--enable=$(DT_CAPABILITIES)";
const ARG_PROXY: &str = r#"PROXY="${ACTIVE_GATE_PROXY}""#;

const ARCH_LABEL: &str = "kubernetes.io/arch";
const OS_LABEL: &str = "kubernetes.io/os";
const BETA_ARCH_LABEL: &str = "beta.kubernetes.io/arch";
const BETA_OS_LABEL: &str = "beta.kubernetes.io/os";
const ARCHITECTURES: [&str; 2] = ["amd64", "arm64"];
const OPERATING_SYSTEMS: [&str; 1] = ["linux"];

/// Inputs of the desired StatefulSet for one capability
#[derive(Clone, Copy, Debug)]
pub struct StatefulSetProperties<'a> {
    /// The owning agent, including its persisted image status
    pub agent: &'a MonitoringAgent,
    /// Which capability to build
    pub capability: &'a Capability,
    /// UID of the kube-system namespace
    pub cluster_uid: &'a str,
    /// Hash of the custom-properties content, empty when none is configured
    pub custom_properties_hash: &'a str,
}

/// Build the desired StatefulSet and stamp its fingerprint
///
/// Capability hooks run before fingerprinting. The owner reference is not
/// part of the manifest; the caller attaches it afterwards.
pub fn build_statefulset(props: &StatefulSetProperties<'_>) -> Result<StatefulSet, Error> {
    let (agent_name, namespace) = object_key("MonitoringAgent", &props.agent.metadata)?;
    let spec = props.capability.spec(&props.agent.spec);
    let status = props.agent.image_status();

    let pod_labels = pod_labels(props, agent_name);
    let mut labels = pod_labels.clone();
    labels.insert(MODULE_LABEL.to_string(), props.capability.module.to_string());

    let pod_annotations = BTreeMap::from([
        (
            IMAGE_HASH_ANNOTATION.to_string(),
            status.image_hash.clone().unwrap_or_default(),
        ),
        (
            IMAGE_VERSION_ANNOTATION.to_string(),
            status.image_version.clone().unwrap_or_default(),
        ),
        (
            CUSTOM_PROPERTIES_HASH_ANNOTATION.to_string(),
            props.custom_properties_hash.to_string(),
        ),
    ]);

    let custom_properties_secret = custom_properties::mounted_secret_name(
        agent_name,
        props.capability.service_account_owner,
        spec.custom_properties.as_ref(),
    );

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(gateway_image(props.agent, &status)?),
        image_pull_policy: Some("Always".to_string()),
        env: Some(build_env(props, namespace)),
        args: Some(build_args(props)),
        resources: spec.resources.clone(),
        volume_mounts: custom_properties_secret.as_ref().map(|_| {
            vec![VolumeMount {
                name: custom_properties::VOLUME_NAME.to_string(),
                mount_path: custom_properties::MOUNT_PATH.to_string(),
                sub_path: Some(custom_properties::DATA_PATH.to_string()),
                read_only: Some(true),
                ..Default::default()
            }]
        }),
        readiness_probe: Some(https_probe("/rest/health", 15, 3)),
        liveness_probe: Some(https_probe("/rest/state", 30, 2)),
        ..Default::default()
    };

    let service_account = spec
        .service_account_name
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| props.capability.default_service_account());

    let mut sts = StatefulSet {
        metadata: ObjectMeta {
            name: Some(props.capability.statefulset_name(agent_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: spec.replicas,
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(identifying_labels(agent_name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: (!spec.node_selector.is_empty())
                        .then(|| spec.node_selector.clone()),
                    service_account_name: Some(service_account),
                    affinity: Some(node_affinity()),
                    tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
                    volumes: custom_properties_secret.map(|secret_name| {
                        vec![Volume {
                            name: custom_properties::VOLUME_NAME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(secret_name),
                                items: Some(vec![KeyToPath {
                                    key: custom_properties::DATA_KEY.to_string(),
                                    path: custom_properties::DATA_PATH.to_string(),
                                    ..Default::default()
                                }]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]
                    }),
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: version::pull_secret_name(agent_name),
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    for hook in props.capability.hooks {
        hook(&mut sts);
    }

    let hash = fingerprint::fingerprint(&sts)?;
    fingerprint::stamp(&mut sts.metadata, hash);
    Ok(sts)
}

/// Labels that tie pods to their agent; also the selector
pub fn identifying_labels(agent_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), agent_name.to_string()),
    ])
}

fn pod_labels(props: &StatefulSetProperties<'_>, agent_name: &str) -> BTreeMap<String, String> {
    let mut labels = props.capability.spec(&props.agent.spec).labels.clone();
    labels.extend(identifying_labels(agent_name));
    labels
}

/// Gateway image for the pod, pinned as tightly as the status allows
///
/// Pinned by digest when one was resolved, else by version tag, else the
/// floating tag.
pub fn gateway_image(agent: &MonitoringAgent, status: &ImageStatus) -> Result<String, Error> {
    let repository = agent.gateway_repository()?;

    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
    Ok(match (non_empty(&status.image_hash), non_empty(&status.image_version)) {
        (Some(digest), _) => format!("{repository}@{digest}"),
        (None, Some(version)) => format!("{repository}:{version}"),
        (None, None) => format!("{repository}:{}", version::FLOATING_TAG),
    })
}

fn build_env(props: &StatefulSetProperties<'_>, namespace: &str) -> Vec<EnvVar> {
    let spec = props.capability.spec(&props.agent.spec);
    let plain = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };

    let mut env = vec![
        plain(ENV_CAPABILITIES, props.capability.capability_name),
        plain(ENV_ID_SEED_NAMESPACE, namespace),
        plain(ENV_ID_SEED_CLUSTER_ID, props.cluster_uid),
    ];
    env.extend(spec.env.iter().cloned());

    match resolve_source(props.agent.spec.proxy.as_ref()) {
        Some(ResolvedSource::SecretRef(secret)) => env.push(EnvVar {
            name: ENV_PROXY.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.to_string(),
                    key: PROXY_SECRET_KEY.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        Some(ResolvedSource::Inline(value)) => env.push(plain(ENV_PROXY, value)),
        None => {}
    }
    env
}

fn build_args(props: &StatefulSetProperties<'_>) -> Vec<String> {
    let spec = props.capability.spec(&props.agent.spec);

    let mut args = vec![ARG_ENABLE.to_string()];
    args.extend(spec.args.iter().cloned());
    if let Some(zone) = props.agent.spec.network_zone() {
        args.push(format!(r#"--networkzone="{zone}""#));
    }
    if resolve_source(props.agent.spec.proxy.as_ref()).is_some() {
        args.push(ARG_PROXY.to_string());
    }
    if let Some(group) = spec.group.as_deref().filter(|g| !g.is_empty()) {
        args.push(format!(r#"--group="{group}""#));
    }
    args
}

fn https_probe(path: &str, period_seconds: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(GATEWAY_PORT),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(90),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

fn node_affinity() -> Affinity {
    let term = |arch_key: &str, os_key: &str| NodeSelectorTerm {
        match_expressions: Some(vec![
            NodeSelectorRequirement {
                key: arch_key.to_string(),
                operator: "In".to_string(),
                values: Some(ARCHITECTURES.iter().map(|s| s.to_string()).collect()),
            },
            NodeSelectorRequirement {
                key: os_key.to_string(),
                operator: "In".to_string(),
                values: Some(OPERATING_SYSTEMS.iter().map(|s| s.to_string()).collect()),
            },
        ]),
        ..Default::default()
    };

    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![
                    term(BETA_ARCH_LABEL, BETA_OS_LABEL),
                    term(ARCH_LABEL, OS_LABEL),
                ],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
