//! Error types for Corral

use thiserror::Error;

/// Result type for Corral operations
pub type Result<T> = std::result::Result<T, CorralError>;

/// Corral error types
#[derive(Error, Debug)]
pub enum CorralError {
    #[error("{0}")]
    UnsupportedHost(String),

    #[error("{0}")]
    InsufficientPrivilege(String),

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("no such container: {0}")]
    IdNotFound(String),

    #[error("cannot {operation} container {id} while it is {state}")]
    StateConflict {
        id: String,
        state: String,
        operation: &'static str,
    },

    #[error("{0}")]
    ResourceExhaustion(String),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}")]
    ExternalCommand { context: String },

    #[error("container {id} removed, {failed} cleanup step(s) failed, first: {first}")]
    CleanupPartial {
        id: String,
        failed: usize,
        first: Box<CorralError>,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CorralError {
    /// Wrap an I/O error raised at the kernel boundary with a short description.
    pub fn external(context: impl Into<String>, source: std::io::Error) -> Self {
        CorralError::External {
            context: context.into(),
            source,
        }
    }

    /// Build a state conflict for an operation refused in `state`.
    pub fn state_conflict(
        id: &str,
        state: impl std::fmt::Display,
        operation: &'static str,
    ) -> Self {
        CorralError::StateConflict {
            id: id.to_string(),
            state: state.to_string(),
            operation,
        }
    }

    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CorralError::UnsupportedHost(_) => "unsupported_host",
            CorralError::InsufficientPrivilege(_) => "insufficient_privilege",
            CorralError::NameConflict(_) => "name_conflict",
            CorralError::IdNotFound(_) => "id_not_found",
            CorralError::StateConflict { .. } => "state_conflict",
            CorralError::ResourceExhaustion(_) => "resource_exhaustion",
            CorralError::CleanupPartial { .. } => "cleanup_partial",
            CorralError::InvalidArgument(_) => "invalid_argument",
            CorralError::External { .. }
            | CorralError::ExternalCommand { .. }
            | CorralError::Lock(_)
            | CorralError::Io(_)
            | CorralError::Json(_) => "external_resource_failure",
        }
    }

    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CorralError::UnsupportedHost(_)
            | CorralError::InsufficientPrivilege(_)
            | CorralError::InvalidArgument(_) => 2,
            _ => 1,
        }
    }

    /// Underlying OS error number, when there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CorralError::External { source, .. } | CorralError::Io(source) => {
                source.raw_os_error()
            }
            CorralError::CleanupPartial { first, .. } => first.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            CorralError::NameConflict("web".into()).kind(),
            "name_conflict"
        );
        assert_eq!(CorralError::IdNotFound("x".into()).kind(), "id_not_found");
        assert_eq!(
            CorralError::state_conflict("x", "created", "stop").kind(),
            "state_conflict"
        );
        assert_eq!(
            CorralError::external("mount", std::io::Error::from_raw_os_error(libc::EPERM)).kind(),
            "external_resource_failure"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CorralError::UnsupportedHost("no".into()).exit_code(), 2);
        assert_eq!(CorralError::InsufficientPrivilege("no".into()).exit_code(), 2);
        assert_eq!(CorralError::IdNotFound("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_cleanup_partial_keeps_first_error() {
        let err = CorralError::CleanupPartial {
            id: "real-1".into(),
            failed: 2,
            first: Box::new(CorralError::external(
                "remove cgroup",
                std::io::Error::from_raw_os_error(libc::EBUSY),
            )),
        };
        assert_eq!(err.kind(), "cleanup_partial");
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        assert!(err.to_string().contains("remove cgroup"));
    }

    #[test]
    fn test_state_conflict_message() {
        let err = CorralError::state_conflict("real-7", "created", "stop");
        assert_eq!(
            err.to_string(),
            "cannot stop container real-7 while it is created"
        );
    }
}
