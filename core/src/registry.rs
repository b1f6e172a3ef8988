//! Registry source policy (`BUILD_REGISTRY_SOURCES`).

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// Environment variable holding the JSON policy.
pub const REGISTRY_SOURCES_ENV: &str = "BUILD_REGISTRY_SOURCES";

/// Allowed, blocked and insecure registry domains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_registries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_registries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_registries: Vec<String>,
}

impl RegistrySources {
    /// Read the policy from the environment. An unset or empty variable
    /// means no restrictions.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(REGISTRY_SOURCES_ENV) {
            Ok(raw) if !raw.is_empty() => Self::parse(&raw).map(Some),
            _ => Ok(None),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            BuildError::ConfigError(format!(
                "parsing ${} ({:?}) as JSON: {}",
                REGISTRY_SOURCES_ENV, raw, e
            ))
        })
    }

    /// Check whether `registry` may be written to. Returns whether it is
    /// marked insecure.
    pub fn check(&self, registry: &str) -> Result<bool> {
        if self.blocked_registries.iter().any(|r| r == registry) {
            return Err(BuildError::PolicyDenied(format!(
                "registry {:?} denied by policy: it is in the blocked registries list",
                registry
            )));
        }
        if !self.allowed_registries.is_empty()
            && !self.allowed_registries.iter().any(|r| r == registry)
        {
            return Err(BuildError::PolicyDenied(format!(
                "registry {:?} denied by policy: not in allowed registries list",
                registry
            )));
        }
        Ok(self.insecure_registries.iter().any(|r| r == registry))
    }
}

/// Registry domain of an image name, when the name carries one explicitly.
///
/// The first path component is a domain if it contains `.` or `:`, or is
/// `localhost`.
pub fn registry_domain(name: &str) -> Option<&str> {
    let (first, rest) = name.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camel_case() {
        let sources = RegistrySources::parse(
            r#"{"insecureRegistries":["local:5000"],"blockedRegistries":["evil.io"]}"#,
        )
        .unwrap();
        assert_eq!(sources.insecure_registries, vec!["local:5000".to_string()]);
        assert_eq!(sources.blocked_registries, vec!["evil.io".to_string()]);
        assert!(sources.allowed_registries.is_empty());
    }

    #[test]
    fn test_parse_invalid() {
        let err = RegistrySources::parse("{not json").unwrap_err();
        assert!(matches!(err, BuildError::ConfigError(_)));
    }

    #[test]
    fn test_blocked() {
        let sources = RegistrySources {
            blocked_registries: vec!["evil.io".to_string()],
            ..Default::default()
        };
        let err = sources.check("evil.io").unwrap_err();
        assert!(matches!(err, BuildError::PolicyDenied(_)));
        assert!(err.to_string().contains("blocked"));
        assert!(!sources.check("quay.io").unwrap());
    }

    #[test]
    fn test_allow_list() {
        let sources = RegistrySources {
            allowed_registries: vec!["quay.io".to_string()],
            insecure_registries: vec!["quay.io".to_string()],
            ..Default::default()
        };
        assert!(sources.check("quay.io").unwrap());
        assert!(sources.check("docker.io").is_err());
    }

    #[test]
    fn test_registry_domain() {
        assert_eq!(registry_domain("quay.io/org/app:1"), Some("quay.io"));
        assert_eq!(registry_domain("localhost/app"), Some("localhost"));
        assert_eq!(registry_domain("host:5000/app"), Some("host:5000"));
        assert_eq!(registry_domain("library/alpine"), None);
        assert_eq!(registry_domain("alpine"), None);
    }
}
