use thiserror::Error;

/// A3S Build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed user input (mount grammar, chown/chmod specs, options)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed `--mount` specifier
    #[error("Invalid mount: {0}")]
    InvalidMount(String),

    /// A named entity (glob match, secret, container, image, layer) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A path resolved outside of the directory it was confined to
    #[error("Path escapes {root}: {path}")]
    PathEscape { root: String, path: String },

    /// Operation rejected by configured policy
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// Remote fetch failure, retryable
    #[error("Network error: {url} - {message}")]
    Network { url: String, message: String },

    /// Content digest did not match the expected value
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Should-never-happen consistency violations
    #[error("Internal error: {0}")]
    Internal(String),

    /// Layer/image/container store error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Filesystem copy error
    #[error("Copier error: {0}")]
    CopierError(String),

    /// Container runtime or isolation error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Image commit error
    #[error("Commit error: {0}")]
    CommitError(String),

    /// Several independent failures that must all be reported
    #[error("{}", join_errors(.0))]
    Multiple(Vec<BuildError>),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn join_errors(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl BuildError {
    /// Whether this error means "no such entry".
    pub fn is_not_found(&self) -> bool {
        match self {
            BuildError::NotFound(_) => true,
            BuildError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            BuildError::Multiple(errors) => errors.iter().any(|e| e.is_not_found()),
            _ => false,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::Network { .. })
    }

    /// Collapse a list of errors into one: the error itself when there is
    /// only one, otherwise an aggregate.
    pub fn from_many(mut errors: Vec<BuildError>) -> BuildError {
        match errors.len() {
            0 => BuildError::Internal("error list was empty".to_string()),
            1 => errors.remove(0),
            _ => BuildError::Multiple(errors),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Build operations
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let error = BuildError::InvalidArgument("bad chmod \"9z\"".to_string());
        assert_eq!(error.to_string(), "Invalid argument: bad chmod \"9z\"");
    }

    #[test]
    fn test_invalid_mount_display() {
        let error = BuildError::InvalidMount("invalid mount type \"foo\"".to_string());
        assert_eq!(error.to_string(), "Invalid mount: invalid mount type \"foo\"");
    }

    #[test]
    fn test_not_found_display() {
        let error = BuildError::NotFound("no items matching glob \"*.txt\"".to_string());
        assert_eq!(
            error.to_string(),
            "Not found: no items matching glob \"*.txt\""
        );
        assert!(error.is_not_found());
    }

    #[test]
    fn test_path_escape_display() {
        let error = BuildError::PathEscape {
            root: "/ctx".to_string(),
            path: "../etc/passwd".to_string(),
        };
        assert_eq!(error.to_string(), "Path escapes /ctx: ../etc/passwd");
    }

    #[test]
    fn test_policy_denied_display() {
        let error = BuildError::PolicyDenied("registry quay.io is blocked".to_string());
        assert_eq!(error.to_string(), "Policy denied: registry quay.io is blocked");
    }

    #[test]
    fn test_network_error_display_and_retryable() {
        let error = BuildError::Network {
            url: "https://example.com/a.tar".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Network error: https://example.com/a.tar - connection reset"
        );
        assert!(error.is_retryable());
        assert!(!BuildError::Internal("x".to_string()).is_retryable());
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let error = BuildError::ChecksumMismatch {
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Checksum mismatch: expected sha256:aa, got sha256:bb"
        );
    }

    #[test]
    fn test_internal_error_display() {
        let error = BuildError::Internal("history mismatch".to_string());
        assert_eq!(error.to_string(), "Internal error: history mismatch");
    }

    #[test]
    fn test_domain_error_display() {
        assert_eq!(
            BuildError::StorageError("layer missing".to_string()).to_string(),
            "Storage error: layer missing"
        );
        assert_eq!(
            BuildError::CopierError("short write".to_string()).to_string(),
            "Copier error: short write"
        );
        assert_eq!(
            BuildError::RuntimeError("exit 1".to_string()).to_string(),
            "Runtime error: exit 1"
        );
        assert_eq!(
            BuildError::CommitError("no layers".to_string()).to_string(),
            "Commit error: no layers"
        );
    }

    #[test]
    fn test_multiple_error_display() {
        let error = BuildError::Multiple(vec![
            BuildError::Other("reading source".to_string()),
            BuildError::Other("writing destination".to_string()),
        ]);
        assert_eq!(error.to_string(), "reading source; writing destination");
    }

    #[test]
    fn test_from_many() {
        assert!(matches!(BuildError::from_many(vec![]), BuildError::Internal(_)));
        let single = BuildError::from_many(vec![BuildError::Other("a".to_string())]);
        assert!(matches!(single, BuildError::Other(_)));
        let many = BuildError::from_many(vec![
            BuildError::Other("a".to_string()),
            BuildError::NotFound("b".to_string()),
        ]);
        assert!(matches!(many, BuildError::Multiple(ref v) if v.len() == 2));
        assert!(many.is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let build_error: BuildError = io_error.into();
        assert!(matches!(build_error, BuildError::IoError(_)));
        assert!(build_error.to_string().contains("file not found"));
        assert!(build_error.is_not_found());
    }

    #[test]
    fn test_config_error_display() {
        let error = BuildError::ConfigError("Missing required field".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: Missing required field"
        );
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let build_error: BuildError = result.unwrap_err().into();
        assert!(matches!(build_error, BuildError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let build_error: BuildError = result.unwrap_err().into();
        assert!(matches!(build_error, BuildError::SerializationError(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(BuildError::Other("test error".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_debug() {
        let error = BuildError::CommitError("test".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("CommitError"));
    }
}
