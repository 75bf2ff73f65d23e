//! Error types for the Gantry controller
//!
//! Errors are structured with fields to aid debugging in production: the
//! failing registry operation, the unreachable load-balancer target, the
//! context a watch died in. Per-unit failures (one service, one broadcast
//! target) are contained and logged where they happen; only errors that
//! affect discovering what work exists propagate upward.

use thiserror::Error;

/// Main error type for Gantry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Pod watch stream error
    #[error("pod watch error: {source}")]
    Watch {
        /// The underlying watcher error
        #[from]
        source: kube::runtime::watcher::Error,
    },

    /// A registry/control-plane call failed
    #[error("registry {operation} failed: {message}")]
    Registry {
        /// The registry operation that failed (e.g. "get_namespaces")
        operation: &'static str,
        /// Description of what failed
        message: String,
    },

    /// A call to a single load-balancer target failed
    #[error("load balancer {target}: {message}")]
    LoadBalancer {
        /// The target's address
        target: String,
        /// Description of what failed
        message: String,
    },

    /// One or more targets of a broadcast failed
    #[error("multiple errors: {}", failures.join(", "))]
    Broadcast {
        /// One message per failing target
        failures: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "scheduler", "event_pump")
        context: String,
    },
}

impl Error {
    /// Create a registry error for the given operation
    pub fn registry(operation: &'static str, cause: impl std::fmt::Display) -> Self {
        Self::Registry {
            operation,
            message: cause.to_string(),
        }
    }

    /// Create a load-balancer target error
    pub fn load_balancer(target: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::LoadBalancer {
            target: target.into(),
            message: cause.to_string(),
        }
    }

    /// Create a broadcast error from per-target failure messages
    pub fn broadcast(failures: Vec<String>) -> Self {
        Self::Broadcast { failures }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_names_the_operation() {
        let error = Error::registry("get_service", "connection refused");
        assert_eq!(
            error.to_string(),
            "registry get_service failed: connection refused"
        );
    }

    #[test]
    fn broadcast_error_concatenates_target_messages() {
        let error = Error::broadcast(vec![
            "10.0.0.2:8081: connection refused".to_string(),
            "10.0.0.5:8081: timed out".to_string(),
        ]);
        assert_eq!(
            error.to_string(),
            "multiple errors: 10.0.0.2:8081: connection refused, 10.0.0.5:8081: timed out"
        );
    }

    #[test]
    fn internal_error_includes_context() {
        let error = Error::internal("scheduler", "pod event stream ended");
        assert_eq!(
            error.to_string(),
            "internal error [scheduler]: pod event stream ended"
        );
    }

    #[test]
    fn load_balancer_error_names_the_target() {
        let error = Error::load_balancer("10.1.2.3:8081", "503 Service Unavailable");
        assert!(error.to_string().contains("10.1.2.3:8081"));
        assert!(error.to_string().contains("503"));
    }
}
