//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Number of hash characters kept by [`JobId::to_short_string`].
const SHORT_HASH_LEN: usize = 7;

/// Content-addressed identifier of a Job.
///
/// Rendered as `name:version:hash`, where `hash` is the hex SHA-256 digest of
/// the job's content. Two jobs with equal ids are considered identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    name: String,
    version: String,
    hash: Option<String>,
}

impl JobId {
    /// Create a fully qualified JobId.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            hash: Some(hash.into()),
        }
    }

    /// Create a JobId without a content hash.
    ///
    /// Such ids only ever match other unhashed ids and are mostly useful as
    /// lookup keys typed by operators.
    pub fn unhashed(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            hash: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// `name:version:abcdef0`, used for container names and log lines.
    pub fn to_short_string(&self) -> String {
        match &self.hash {
            Some(hash) => {
                let short: String = hash.chars().take(SHORT_HASH_LEN).collect();
                format!("{}:{}:{}", self.name, self.version, short)
            }
            None => format!("{}:{}", self.name, self.version),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "{}:{}:{}", self.name, self.version, hash),
            None => write!(f, "{}:{}", self.name, self.version),
        }
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let invalid = || CoreError::InvalidJobId(s.to_string());

        match parts.as_slice() {
            [name, version] if !name.is_empty() && !version.is_empty() => {
                Ok(Self::unhashed(*name, *version))
            }
            [name, version, hash]
                if !name.is_empty()
                    && !version.is_empty()
                    && !hash.is_empty()
                    && hash.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Self::new(*name, *version, *hash))
            }
            _ => Err(invalid()),
        }
    }
}

/// Opaque handle the container runtime returns when a container is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a new ContainerId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_display() {
        let id = JobId::new("foobar", "4711", "deadbeef0123");
        assert_eq!(id.to_string(), "foobar:4711:deadbeef0123");
        assert_eq!(id.to_short_string(), "foobar:4711:deadbee");
    }

    #[test]
    fn test_short_string_counts_chars() {
        let id = JobId::new("foobar", "4711", "ééééééééé");
        assert_eq!(id.to_short_string(), "foobar:4711:ééééééé");

        let id = JobId::new("foobar", "4711", "ab");
        assert_eq!(id.to_short_string(), "foobar:4711:ab");
    }

    #[test]
    fn test_job_id_parse() {
        let id: JobId = "foobar:4711:deadbeef".parse().unwrap();
        assert_eq!(id.name(), "foobar");
        assert_eq!(id.version(), "4711");
        assert_eq!(id.hash(), Some("deadbeef"));

        let unhashed: JobId = "foobar:4711".parse().unwrap();
        assert_eq!(unhashed.hash(), None);
        assert_ne!(id, unhashed);
    }

    #[test]
    fn test_job_id_parse_rejects_garbage() {
        assert!("foobar".parse::<JobId>().is_err());
        assert!("foobar::".parse::<JobId>().is_err());
        assert!("a:b:not-hex".parse::<JobId>().is_err());
        assert!("a:b:c:d".parse::<JobId>().is_err());
    }

    #[test]
    fn test_container_id_display() {
        let id = ContainerId::new("potato");
        assert_eq!(format!("{}", id), "potato");
    }
}
