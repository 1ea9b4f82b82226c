//! Container registry access
//!
//! Resolves an image reference to its content digest and version through the
//! Docker Registry HTTP API v2. Credentials come from a `.dockerconfigjson`
//! document; registries that answer with a bearer challenge are handled by
//! fetching a token from the advertised realm.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use vigil_common::crd::ImageStatus;
use vigil_common::Error;

/// Image label carrying the gateway version
pub const VERSION_LABEL: &str = "org.opencontainers.image.version";

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_HEADER: &str = "docker-content-digest";

const TARGET_OS: &str = "linux";
const TARGET_ARCH: &str = "amd64";

/// Version and digest of a resolved image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageVersion {
    /// Version reported by the image
    pub version: String,
    /// Content digest (`sha256:...`)
    pub digest: String,
}

impl From<ImageVersion> for ImageStatus {
    fn from(v: ImageVersion) -> Self {
        ImageStatus {
            image_version: Some(v.version),
            image_hash: Some(v.digest),
        }
    }
}

/// Username/password pair for a registry
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Registry username
    pub username: String,
    /// Registry password or token
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parsed `.dockerconfigjson` document
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DockerConfig {
    /// Credentials keyed by registry
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuth>,
}

/// One registry entry of a docker config
#[derive(Clone, Default, Deserialize)]
pub struct DockerAuth {
    /// Username
    #[serde(default)]
    pub username: Option<String>,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
    /// Base64 of `username:password`
    #[serde(default)]
    pub auth: Option<String>,
}

impl fmt::Debug for DockerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl DockerAuth {
    /// Credentials from explicit fields, falling back to the `auth` field
    pub fn credentials(&self) -> Option<RegistryCredentials> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Some(RegistryCredentials {
                username: username.clone(),
                password: password.clone(),
            });
        }

        let decoded = BASE64.decode(self.auth.as_deref()?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(RegistryCredentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl DockerConfig {
    /// Parse a `.dockerconfigjson` payload
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Credentials for a registry host
    ///
    /// Keys may be written as bare hosts or as URLs (`https://host/v1/`).
    pub fn credentials_for(&self, host: &str) -> Option<RegistryCredentials> {
        self.auths
            .iter()
            .find(|(key, _)| registry_key_host(key) == host)
            .and_then(|(_, auth)| auth.credentials())
    }
}

fn registry_key_host(key: &str) -> &str {
    let rest = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = rest.split('/').next().unwrap_or(rest);
    if host == DOCKER_HUB || host == "index.docker.io" {
        DOCKER_HUB_REGISTRY
    } else {
        host
    }
}

/// Tag or digest part of an image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    /// Mutable tag
    Tag(String),
    /// Immutable content digest
    Digest(String),
}

/// A parsed image reference (`registry/repository[:tag|@digest]`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Tag or digest
    pub reference: Reference,
}

impl ImageReference {
    /// Tag of this reference, if it is not pinned by digest
    pub fn tag(&self) -> Option<&str> {
        match &self.reference {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }

    fn reference_str(&self) -> &str {
        match &self.reference {
            Reference::Tag(s) | Reference::Digest(s) => s,
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: &str| Error::resolution(s, msg);

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (s, None),
        };

        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], Some(&name[last_slash + i + 1..])),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };

        let (registry, repository) = if registry == DOCKER_HUB {
            let repository = if repository.contains('/') {
                repository
            } else {
                format!("library/{repository}")
            };
            (DOCKER_HUB_REGISTRY.to_string(), repository)
        } else {
            (registry, repository)
        };

        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        if !valid_repository(&repository) {
            return Err(invalid("invalid repository name"));
        }

        let reference = match (digest, tag) {
            (Some(d), _) if d.is_empty() => return Err(invalid("empty digest")),
            (Some(d), _) if !d.contains(':') => return Err(invalid("malformed digest")),
            (Some(d), _) => Reference::Digest(d.to_string()),
            (None, Some(t)) if t.is_empty() => return Err(invalid("empty tag")),
            (None, Some(t)) if !valid_tag(t) => return Err(invalid("invalid tag")),
            (None, Some(t)) => Reference::Tag(t.to_string()),
            (None, None) => Reference::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

/// Path components of lowercase alphanumerics joined by `.`, `_` or `-`
fn valid_repository(repository: &str) -> bool {
    repository.split('/').all(|component| {
        let bytes = component.as_bytes();
        !bytes.is_empty()
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(b))
    })
}

fn valid_tag(tag: &str) -> bool {
    tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b))
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Reference::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

/// Resolves image references to version metadata
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Look up the digest and version of an image
    async fn resolve(
        &self,
        image: &ImageReference,
        credentials: Option<RegistryCredentials>,
    ) -> Result<ImageVersion, Error>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    manifests: Vec<PlatformManifest>,
    #[serde(default)]
    config: Option<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct PlatformManifest {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

impl Manifest {
    fn is_index(&self) -> bool {
        !self.manifests.is_empty()
    }

    fn platform_digest(&self, os: &str, architecture: &str) -> Option<&str> {
        self.manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == os && p.architecture == architecture)
            })
            .map(|m| m.digest.as_str())
    }
}

impl ImageConfig {
    fn version_label(&self) -> Option<&str> {
        self.config
            .as_ref()?
            .labels
            .as_ref()?
            .get(VERSION_LABEL)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge
#[derive(Clone, Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut values = BTreeMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => after.split_once(',').unwrap_or((after, "")),
        };
        values.insert(key.trim().to_ascii_lowercase(), value.to_string());
        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    Some(BearerChallenge {
        realm: values.remove("realm")?,
        service: values.remove("service"),
        scope: values.remove("scope"),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client speaking the Docker Registry HTTP API v2
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
}

impl HttpRegistryClient {
    /// Create a registry client
    ///
    /// Requests carry no timeout of their own; a resolution lasts as long as
    /// the reconcile that awaits it.
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            Error::internal_with_context("registry", format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Self { client })
    }
}

/// Loopback registries are served over plain HTTP, everything else over TLS
fn registry_scheme(registry: &str) -> &'static str {
    let host = match registry.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => registry,
    };
    if host == "localhost" || host.starts_with("127.") || host == "[::1]" {
        "http"
    } else {
        "https"
    }
}

/// Auth state for the requests of one resolution
struct Session<'a> {
    client: &'a reqwest::Client,
    image: &'a ImageReference,
    credentials: Option<&'a RegistryCredentials>,
    token: Option<String>,
}

impl Session<'_> {
    fn fail(&self, msg: impl Into<String>) -> Error {
        Error::resolution(self.image.to_string(), msg)
    }

    fn url(&self, kind: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            registry_scheme(&self.image.registry),
            self.image.registry,
            self.image.repository,
            kind,
            reference
        )
    }

    fn request(&self, url: &str, accept: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(accept) = accept {
            req = req.header(ACCEPT, accept);
        }
        match (&self.token, self.credentials) {
            (Some(token), _) => req.bearer_auth(token),
            (None, Some(c)) => req.basic_auth(&c.username, Some(&c.password)),
            (None, None) => req,
        }
    }

    async fn get(&mut self, url: &str, accept: Option<&str>) -> Result<reqwest::Response, Error> {
        let response = self
            .request(url, accept)
            .send()
            .await
            .map_err(|e| self.fail(format!("request failed: {e}")))?;

        let response = if response.status() == StatusCode::UNAUTHORIZED && self.token.is_none() {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge)
                .ok_or_else(|| self.fail("HTTP 401 Unauthorized"))?;
            self.token = Some(self.fetch_token(&challenge).await?);
            self.request(url, accept)
                .send()
                .await
                .map_err(|e| self.fail(format!("request failed: {e}")))?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(self.fail(format!("GET {url}: HTTP {}", response.status())));
        }
        Ok(response)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, Error> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", self.image.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let mut req = self.client.get(&challenge.realm).query(&query);
        if let Some(c) = self.credentials {
            req = req.basic_auth(&c.username, Some(&c.password));
        }

        debug!(realm = %challenge.realm, "requesting registry token");
        let response = req
            .send()
            .await
            .map_err(|e| self.fail(format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(self.fail(format!("token request: HTTP {}", response.status())));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.fail(format!("invalid token response: {e}")))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| self.fail("token response carries no token"))
    }

    async fn manifest(&mut self, reference: &str) -> Result<(Option<String>, Manifest), Error> {
        let url = self.url("manifests", reference);
        let response = self.get(&url, Some(MANIFEST_ACCEPT)).await?;
        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let manifest = response
            .json()
            .await
            .map_err(|e| self.fail(format!("invalid manifest: {e}")))?;
        Ok((digest, manifest))
    }

    async fn config(&mut self, digest: &str) -> Result<ImageConfig, Error> {
        let url = self.url("blobs", digest);
        let response = self.get(&url, None).await?;
        response
            .json()
            .await
            .map_err(|e| self.fail(format!("invalid image config: {e}")))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve(
        &self,
        image: &ImageReference,
        credentials: Option<RegistryCredentials>,
    ) -> Result<ImageVersion, Error> {
        let mut session = Session {
            client: &self.client,
            image,
            credentials: credentials.as_ref(),
            token: None,
        };

        let (digest, mut manifest) = session.manifest(image.reference_str()).await?;
        let digest = match (&image.reference, digest) {
            (Reference::Digest(d), _) => d.clone(),
            (Reference::Tag(_), Some(d)) => d,
            (Reference::Tag(_), None) => {
                return Err(session.fail("registry did not report a content digest"))
            }
        };

        if manifest.is_index() {
            let platform = manifest
                .platform_digest(TARGET_OS, TARGET_ARCH)
                .map(str::to_string)
                .ok_or_else(|| {
                    session.fail(format!("no {TARGET_OS}/{TARGET_ARCH} image in index"))
                })?;
            manifest = session.manifest(&platform).await?.1;
        }

        let config_digest = manifest
            .config
            .map(|c| c.digest)
            .ok_or_else(|| session.fail("manifest has no config"))?;
        let config = session.config(&config_digest).await?;

        let version = config
            .version_label()
            .or_else(|| image.tag())
            .map(str::to_string)
            .ok_or_else(|| session.fail(format!("image has no '{VERSION_LABEL}' label")))?;

        info!(image = %image, version = %version, digest = %digest, "resolved image");
        Ok(ImageVersion { version, digest })
    }
}
