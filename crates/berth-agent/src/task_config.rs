//! Host-resolved launch parameters and service registration for one attempt.
//!
//! A [`TaskConfig`] is derived from a [`Job`] once per run attempt and never
//! changes afterwards. Resolution is deterministic and only fails when the job
//! references a port name it does not declare.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use berth_core::{HealthCheck, HealthCheckKind, Job, JobId, PortMapping};

use crate::decorator::ContainerDecorator;
use crate::runtime::ContainerSpec;

/// Label carrying the full job id.
pub const JOB_ID_LABEL: &str = "berth.job-id";
/// Label carrying the agent namespace.
pub const NAMESPACE_LABEL: &str = "berth.namespace";

/// Malformed job input detected while resolving a [`TaskConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("registration '{endpoint}' references undeclared port '{port}'")]
    UnknownRegistrationPort { endpoint: String, port: String },

    #[error("health check references undeclared port '{0}'")]
    UnknownHealthCheckPort(String),
}

/// Health check attached to a registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHealthCheck {
    pub kind: HealthCheckKind,
    /// Request path, only set for HTTP checks.
    pub path: Option<String>,
}

impl EndpointHealthCheck {
    pub fn http(path: impl Into<String>) -> Self {
        Self {
            kind: HealthCheckKind::Http,
            path: Some(path.into()),
        }
    }

    pub fn tcp() -> Self {
        Self {
            kind: HealthCheckKind::Tcp,
            path: None,
        }
    }
}

/// An externally reachable service address of a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub health_check: Option<EndpointHealthCheck>,
}

/// Endpoints a task announces once it is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRegistration {
    endpoints: Vec<Endpoint>,
}

impl ServiceRegistration {
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Immutable, host-resolved configuration of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    job: Job,
    job_id: JobId,
    host: String,
    namespace: String,
    spec: ContainerSpec,
    registration: ServiceRegistration,
}

impl TaskConfig {
    /// Resolve `job` for this host.
    ///
    /// Decorators are applied to the launch parameters in the given order.
    pub fn resolve(
        job: &Job,
        host: &str,
        namespace: &str,
        decorators: &[Arc<dyn ContainerDecorator>],
    ) -> Result<Self, ConfigError> {
        let job_id = job.id();

        if let Some(check) = &job.health_check {
            if !job.ports.contains_key(check.port()) {
                return Err(ConfigError::UnknownHealthCheckPort(check.port().to_string()));
            }
        }

        let registration = resolve_registration(job, host)?;

        let mut spec = ContainerSpec {
            image: job.image.clone(),
            command: job.command.clone(),
            env: job.env.clone(),
            ports: job.ports.clone(),
            labels: BTreeMap::new(),
            hostname: None,
        };
        for (name, mapping) in &job.ports {
            spec.env.insert(
                port_env_var(name),
                format!("{}:{}", host, mapping.external_port),
            );
        }
        spec.env.insert("BERTH_JOB_ID".to_string(), job_id.to_string());
        spec.labels.insert(JOB_ID_LABEL.to_string(), job_id.to_string());
        spec.labels.insert(NAMESPACE_LABEL.to_string(), namespace.to_string());

        for decorator in decorators {
            decorator.decorate(job, &mut spec);
        }

        Ok(Self {
            job: job.clone(),
            job_id,
            host: host.to_string(),
            namespace: namespace.to_string(),
            spec,
            registration,
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Decorated launch parameters.
    pub fn container_spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    pub fn ports(&self) -> &BTreeMap<String, PortMapping> {
        &self.job.ports
    }

    /// Port mapping the job's health check probes, if it has one.
    pub fn health_check_port(&self) -> Option<PortMapping> {
        self.job
            .health_check
            .as_ref()
            .and_then(|check| self.job.ports.get(check.port()).copied())
    }

    /// `<namespace>-<short job id>`, sanitized for use as a container name.
    pub fn container_name_prefix(&self) -> String {
        format!("{}-{}", self.namespace, self.job_id.to_short_string())
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

fn resolve_registration(job: &Job, host: &str) -> Result<ServiceRegistration, ConfigError> {
    let mut endpoints = Vec::with_capacity(job.registrations.len());

    for registration in &job.registrations {
        let mapping = job.ports.get(&registration.port).ok_or_else(|| {
            ConfigError::UnknownRegistrationPort {
                endpoint: registration.endpoint.to_string(),
                port: registration.port.clone(),
            }
        })?;

        let health_check = job
            .health_check
            .as_ref()
            .filter(|check| check.port() == registration.port)
            .map(|check| match check {
                HealthCheck::Http { path, .. } => EndpointHealthCheck::http(path.clone()),
                HealthCheck::Tcp { .. } => EndpointHealthCheck::tcp(),
            });

        endpoints.push(Endpoint {
            name: registration.endpoint.name.clone(),
            protocol: registration.endpoint.protocol.clone(),
            host: host.to_string(),
            port: mapping.external_port,
            health_check,
        });
    }

    Ok(ServiceRegistration { endpoints })
}

/// `default-port` -> `BERTH_PORT_DEFAULT_PORT`
fn port_env_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("BERTH_PORT_{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorator::LabelDecorator;
    use berth_core::ServiceEndpoint;

    const HOST: &str = "HOST";
    const PORT_NAME: &str = "default-port";
    const EXTERNAL_PORT: u16 = 20000;

    fn job() -> Job {
        Job::new("foobar", "4711", "spotify:17")
            .with_command(["foo", "bar"])
            .with_port(PORT_NAME, PortMapping::of(8080, EXTERNAL_PORT))
            .with_registration(ServiceEndpoint::of("service", "http"), PORT_NAME)
    }

    #[test]
    fn test_registration_with_http_health_check() {
        let job = job().with_health_check(HealthCheck::http("/health", PORT_NAME));
        let config = TaskConfig::resolve(&job, HOST, "test", &[]).unwrap();

        let endpoints = config.registration().endpoints();
        assert_eq!(endpoints.len(), 1);
        let endpoint = &endpoints[0];
        let check = endpoint.health_check.as_ref().unwrap();
        assert_eq!(check.path.as_deref(), Some("/health"));
        assert_eq!(check.kind, HealthCheckKind::Http);
        assert_eq!(endpoint.port, EXTERNAL_PORT);
        assert_eq!(endpoint.name, "service");
        assert_eq!(endpoint.protocol, "http");
        assert_eq!(endpoint.host, HOST);
    }

    #[test]
    fn test_registration_with_tcp_health_check() {
        let job = job().with_health_check(HealthCheck::tcp(PORT_NAME));
        let config = TaskConfig::resolve(&job, HOST, "test", &[]).unwrap();

        let endpoint = &config.registration().endpoints()[0];
        let check = endpoint.health_check.as_ref().unwrap();
        assert_eq!(check.kind, HealthCheckKind::Tcp);
        assert_eq!(check.path, None);
        assert_eq!(endpoint.port, EXTERNAL_PORT);
    }

    #[test]
    fn test_registration_without_health_check() {
        let config = TaskConfig::resolve(&job(), HOST, "test", &[]).unwrap();

        let endpoint = &config.registration().endpoints()[0];
        assert!(endpoint.health_check.is_none());
        assert!(config.health_check_port().is_none());
    }

    #[test]
    fn test_health_check_on_other_port_is_not_attached() {
        let job = job()
            .with_port("admin", PortMapping::of(8081, 20001))
            .with_health_check(HealthCheck::tcp("admin"));
        let config = TaskConfig::resolve(&job, HOST, "test", &[]).unwrap();

        assert!(config.registration().endpoints()[0].health_check.is_none());
        assert_eq!(config.health_check_port(), Some(PortMapping::of(8081, 20001)));
    }

    #[test]
    fn test_endpoints_keep_declaration_order() {
        let job = job()
            .with_port("admin", PortMapping::of(8081, 20001))
            .with_registration(ServiceEndpoint::of("admin", "http"), "admin")
            .with_registration(ServiceEndpoint::of("alpha", "tcp"), PORT_NAME);
        let config = TaskConfig::resolve(&job, HOST, "test", &[]).unwrap();

        let names: Vec<&str> = config
            .registration()
            .endpoints()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, ["service", "admin", "alpha"]);
    }

    #[test]
    fn test_unknown_registration_port() {
        let job = job().with_registration(ServiceEndpoint::of("other", "http"), "missing");
        let err = TaskConfig::resolve(&job, HOST, "test", &[]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownRegistrationPort {
                endpoint: "other/http".to_string(),
                port: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_health_check_port() {
        let job = job().with_health_check(HealthCheck::http("/health", "missing"));
        let err = TaskConfig::resolve(&job, HOST, "test", &[]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownHealthCheckPort("missing".to_string()));
    }

    #[test]
    fn test_container_spec() {
        let decorators: Vec<Arc<dyn ContainerDecorator>> = vec![
            Arc::new(LabelDecorator::new().with_label("team", "a")),
            Arc::new(LabelDecorator::new().with_label("team", "b")),
        ];
        let config = TaskConfig::resolve(&job(), HOST, "test", &decorators).unwrap();
        let spec = config.container_spec();

        assert_eq!(spec.image, "spotify:17");
        assert_eq!(spec.command, ["foo", "bar"]);
        assert_eq!(spec.env["BERTH_PORT_DEFAULT_PORT"], "HOST:20000");
        assert_eq!(spec.env["BERTH_JOB_ID"], job().id().to_string());
        assert_eq!(spec.labels[NAMESPACE_LABEL], "test");
        // Later decorators win.
        assert_eq!(spec.labels["team"], "b");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let a = TaskConfig::resolve(&job(), HOST, "test", &[]).unwrap();
        let b = TaskConfig::resolve(&job(), HOST, "test", &[]).unwrap();
        assert_eq!(a.container_spec(), b.container_spec());
        assert_eq!(a.registration(), b.registration());
    }

    #[test]
    fn test_container_name_prefix() {
        let config = TaskConfig::resolve(&job(), HOST, "test", &[]).unwrap();
        let prefix = config.container_name_prefix();
        assert!(prefix.starts_with("test-foobar_4711_"));
        assert!(!prefix.contains(':'));
    }
}
