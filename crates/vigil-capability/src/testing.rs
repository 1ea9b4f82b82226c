//! In-memory cluster used by tests that need state across calls

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;

use vigil_common::crd::{ImageStatus, MonitoringAgent, MonitoringAgentSpec};
use vigil_common::Error;

use crate::client::{object_key, ClusterClient};

/// Agent `tenant/agent` pointing at `tenant.example.com`
pub fn agent() -> MonitoringAgent {
    let mut agent = MonitoringAgent::new(
        "agent",
        MonitoringAgentSpec {
            api_url: "https://tenant.example.com/api".to_string(),
            ..Default::default()
        },
    );
    agent.metadata.namespace = Some("tenant".to_string());
    agent.metadata.uid = Some("agent-uid".to_string());
    agent
}

type Key = (String, String);

#[derive(Default)]
struct State {
    statefulsets: BTreeMap<Key, StatefulSet>,
    secrets: BTreeMap<Key, Secret>,
    statuses: BTreeMap<Key, ImageStatus>,
    next_version: u64,
    statefulset_writes: usize,
    secret_writes: usize,
}

impl State {
    fn persist(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", self.next_version));
        }
    }
}

/// Object store with create/replace semantics close to the API server's
pub struct FakeCluster {
    state: Mutex<State>,
    cluster_uid: String,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::with_cluster_uid("cluster-uid")
    }

    pub fn with_cluster_uid(uid: &str) -> Self {
        Self {
            state: Mutex::new(State::default()),
            cluster_uid: uid.to_string(),
        }
    }

    /// Seed a StatefulSet without counting it as a write
    pub fn insert_statefulset(&self, mut sts: StatefulSet) {
        let mut state = self.state.lock();
        state.persist(&mut sts.metadata);
        let key = key_of(&sts.metadata);
        state.statefulsets.insert(key, sts);
    }

    /// Seed a Secret without counting it as a write
    pub fn insert_secret(&self, mut secret: Secret) {
        let mut state = self.state.lock();
        state.persist(&mut secret.metadata);
        let key = key_of(&secret.metadata);
        state.secrets.insert(key, secret);
    }

    pub fn statefulset(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().statefulsets.get(&key).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().secrets.get(&key).cloned()
    }

    pub fn gateway_status(&self, namespace: &str, name: &str) -> Option<ImageStatus> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().statuses.get(&key).cloned()
    }

    pub fn statefulset_writes(&self) -> usize {
        self.state.lock().statefulset_writes
    }

    pub fn secret_writes(&self) -> usize {
        self.state.lock().secret_writes
    }
}

fn key_of(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn check_replace(kind: &str, live: Option<&ObjectMeta>, desired: &ObjectMeta) -> Result<(), Error> {
    let name = desired.name.clone().unwrap_or_default();
    match live {
        None => Err(Error::not_found(
            kind,
            desired.namespace.clone().unwrap_or_default(),
            name,
        )),
        Some(live) if live.resource_version != desired.resource_version => {
            Err(Error::conflict(kind, name, "resourceVersion mismatch"))
        }
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_statefulset(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        Ok(self.statefulset(namespace, name))
    }

    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet, Error> {
        let (name, _) = object_key("StatefulSet", &statefulset.metadata)?;
        let key = key_of(&statefulset.metadata);
        let mut state = self.state.lock();
        if state.statefulsets.contains_key(&key) {
            return Err(Error::conflict("StatefulSet", name, "already exists"));
        }
        let mut created = statefulset.clone();
        state.persist(&mut created.metadata);
        state.statefulset_writes += 1;
        state.statefulsets.insert(key, created.clone());
        Ok(created)
    }

    async fn update_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet, Error> {
        object_key("StatefulSet", &statefulset.metadata)?;
        let key = key_of(&statefulset.metadata);
        let mut state = self.state.lock();
        check_replace(
            "StatefulSet",
            state.statefulsets.get(&key).map(|s| &s.metadata),
            &statefulset.metadata,
        )?;
        let mut updated = statefulset.clone();
        state.persist(&mut updated.metadata);
        state.statefulset_writes += 1;
        state.statefulsets.insert(key, updated.clone());
        Ok(updated)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let (name, _) = object_key("Secret", &secret.metadata)?;
        let key = key_of(&secret.metadata);
        let mut state = self.state.lock();
        if state.secrets.contains_key(&key) {
            return Err(Error::conflict("Secret", name, "already exists"));
        }
        let mut created = secret.clone();
        state.persist(&mut created.metadata);
        state.secret_writes += 1;
        state.secrets.insert(key, created.clone());
        Ok(created)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        object_key("Secret", &secret.metadata)?;
        let key = key_of(&secret.metadata);
        let mut state = self.state.lock();
        check_replace(
            "Secret",
            state.secrets.get(&key).map(|s| &s.metadata),
            &secret.metadata,
        )?;
        let mut updated = secret.clone();
        state.persist(&mut updated.metadata);
        state.secret_writes += 1;
        state.secrets.insert(key, updated.clone());
        Ok(updated)
    }

    async fn kube_system_uid(&self) -> Result<String, Error> {
        Ok(self.cluster_uid.clone())
    }

    async fn patch_gateway_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ImageStatus,
    ) -> Result<(), Error> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().statuses.insert(key, status.clone());
        Ok(())
    }
}
