//! Job descriptors: the immutable description of a workload.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{CoreError, JobId};

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named port: the port the container listens on and the port the host exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub internal_port: u16,
    pub external_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// A TCP mapping from `internal` to `external`.
    pub fn of(internal_port: u16, external_port: u16) -> Self {
        Self {
            internal_port,
            external_port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Name and protocol under which a service is announced, e.g. `service/http`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub protocol: String,
}

impl ServiceEndpoint {
    pub fn of(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.protocol)
    }
}

/// Binds a service endpoint to one of the job's named ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Registration {
    pub endpoint: ServiceEndpoint,
    /// Name of the port in [`Job::ports`].
    pub port: String,
}

/// Kind of readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckKind {
    Http,
    Tcp,
}

/// Readiness probe declared by a job, bound to one of its named ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    Http { path: String, port: String },
    Tcp { port: String },
}

impl HealthCheck {
    pub fn http(path: impl Into<String>, port: impl Into<String>) -> Self {
        Self::Http {
            path: path.into(),
            port: port.into(),
        }
    }

    pub fn tcp(port: impl Into<String>) -> Self {
        Self::Tcp { port: port.into() }
    }

    /// Name of the port this check probes.
    pub fn port(&self) -> &str {
        match self {
            Self::Http { port, .. } | Self::Tcp { port } => port,
        }
    }

    pub fn kind(&self) -> HealthCheckKind {
        match self {
            Self::Http { .. } => HealthCheckKind::Http,
            Self::Tcp { .. } => HealthCheckKind::Tcp,
        }
    }
}

/// Immutable description of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub version: String,
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Named port mappings.
    #[serde(default)]
    pub ports: BTreeMap<String, PortMapping>,

    /// Service registrations, in declaration order.
    #[serde(default)]
    pub registrations: Vec<Registration>,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl Job {
    /// Create a new Job running `image`.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            ports: BTreeMap::new(),
            registrations: Vec::new(),
            health_check: None,
        }
    }

    /// Builder method to set the command.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builder method to add a named port.
    pub fn with_port(mut self, name: impl Into<String>, mapping: PortMapping) -> Self {
        self.ports.insert(name.into(), mapping);
        self
    }

    /// Builder method to register `endpoint` on the named port.
    pub fn with_registration(mut self, endpoint: ServiceEndpoint, port: impl Into<String>) -> Self {
        self.registrations.push(Registration {
            endpoint,
            port: port.into(),
        });
        self
    }

    /// Builder method to set the health check.
    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }

    /// Content-addressed identity of this job.
    pub fn id(&self) -> JobId {
        JobId::new(&self.name, &self.version, self.content_hash())
    }

    /// Check the fields every runnable job needs.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(CoreError::InvalidJob(format!(
                "name must be non-empty and free of ':' (got '{}')",
                self.name
            )));
        }
        if self.version.is_empty() || self.version.contains(':') {
            return Err(CoreError::InvalidJob(format!(
                "version must be non-empty and free of ':' (got '{}')",
                self.version
            )));
        }
        if self.image.is_empty() {
            return Err(CoreError::InvalidJob(format!(
                "job '{}' has no image",
                self.name
            )));
        }
        Ok(())
    }

    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();

        feed(&mut hasher, &self.name);
        feed(&mut hasher, &self.version);
        feed(&mut hasher, &self.image);

        hasher.update((self.command.len() as u64).to_le_bytes());
        for arg in &self.command {
            feed(&mut hasher, arg);
        }

        hasher.update((self.env.len() as u64).to_le_bytes());
        for (key, value) in &self.env {
            feed(&mut hasher, key);
            feed(&mut hasher, value);
        }

        hasher.update((self.ports.len() as u64).to_le_bytes());
        for (name, mapping) in &self.ports {
            feed(&mut hasher, name);
            hasher.update(mapping.internal_port.to_le_bytes());
            hasher.update(mapping.external_port.to_le_bytes());
            feed(&mut hasher, mapping.protocol.as_str());
        }

        hasher.update((self.registrations.len() as u64).to_le_bytes());
        for registration in &self.registrations {
            feed(&mut hasher, &registration.endpoint.name);
            feed(&mut hasher, &registration.endpoint.protocol);
            feed(&mut hasher, &registration.port);
        }

        match &self.health_check {
            None => hasher.update([0u8]),
            Some(HealthCheck::Http { path, port }) => {
                hasher.update([1u8]);
                feed(&mut hasher, path);
                feed(&mut hasher, port);
            }
            Some(HealthCheck::Tcp { port }) => {
                hasher.update([2u8]);
                feed(&mut hasher, port);
            }
        }

        hex::encode(hasher.finalize())
    }
}

/// Length-prefix every string so adjacent fields cannot run into each other.
fn feed(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("foobar", "4711", "spotify:17")
            .with_command(["foo", "bar"])
            .with_port("default-port", PortMapping::of(8080, 20000))
            .with_registration(ServiceEndpoint::of("service", "http"), "default-port")
    }

    #[test]
    fn test_id_is_deterministic() {
        assert_eq!(job().id(), job().id());
        assert_eq!(job().id().name(), "foobar");
        assert_eq!(job().id().version(), "4711");
    }

    #[test]
    fn test_id_tracks_content() {
        let changed = job().with_env("FOO", "1");
        assert_ne!(job().id(), changed.id());

        let checked = job().with_health_check(HealthCheck::tcp("default-port"));
        assert_ne!(job().id(), checked.id());
    }

    #[test]
    fn test_id_separates_adjacent_fields() {
        let a = Job::new("foobar", "4711", "img").with_command(["ab", "c"]);
        let b = Job::new("foobar", "4711", "img").with_command(["a", "bc"]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_validate() {
        assert!(job().validate().is_ok());
        assert!(Job::new("", "1", "img").validate().is_err());
        assert!(Job::new("a:b", "1", "img").validate().is_err());
        assert!(Job::new("a", "1", "").validate().is_err());
    }

    #[test]
    fn test_health_check_port() {
        assert_eq!(HealthCheck::http("/health", "p").port(), "p");
        assert_eq!(HealthCheck::tcp("q").port(), "q");
        assert_eq!(HealthCheck::tcp("q").kind(), HealthCheckKind::Tcp);
    }

    #[test]
    fn test_deserialize_job() {
        let json = r#"{
            "name": "web",
            "version": "1",
            "image": "nginx:latest",
            "ports": {"http": {"internal_port": 80, "external_port": 8080}},
            "registrations": [{"endpoint": {"name": "web", "protocol": "http"}, "port": "http"}],
            "health_check": {"type": "http", "path": "/", "port": "http"}
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.ports["http"].protocol, Protocol::Tcp);
        assert_eq!(job.health_check, Some(HealthCheck::http("/", "http")));
        assert!(job.command.is_empty());
    }
}
