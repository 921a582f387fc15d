//! Error types for the NetIP operator
//!
//! Errors are structured with fields to aid debugging in production. Every
//! error maps onto one of the reporting kinds surfaced as the `error_type`
//! metric label: `transient`, `auth`, `conflict`, `invalid_spec`, `internal`.

use thiserror::Error;

use crate::cloud::DriverError;

/// Reporting class of an error, used as the `error_type` metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient failure (cloud 5xx, API timeout); retried on the next tick
    Transient,
    /// Credential or permission failure; surfaced prominently, retried
    Auth,
    /// Conflicting external state (IP leaked elsewhere, stale claims)
    Conflict,
    /// The pool spec is rejected; the pool is skipped until it changes
    InvalidSpec,
    /// Unexpected invariant violation
    Internal,
}

impl ErrorKind {
    /// Convert to the metrics label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::Conflict => "conflict",
            Self::InvalidSpec => "invalid_spec",
            Self::Internal => "internal",
        }
    }
}

/// Main error type for NetIP operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud driver error, carrying the pool and binding it occurred on
    #[error("cloud driver error for pool {pool} ({ip} on {node}): {source}")]
    Driver {
        /// Pool being reconciled
        pool: String,
        /// IP involved in the failed operation (empty for discovery)
        ip: String,
        /// Node involved in the failed operation
        node: String,
        /// The underlying driver error
        source: DriverError,
    },

    /// Pool spec rejected during validation
    #[error("invalid spec for pool {pool}: {message}")]
    InvalidSpec {
        /// Pool with the invalid spec
        pool: String,
        /// Description of what is invalid
        message: String,
    },

    /// Conflicting external state the controller cannot reconcile this tick
    #[error("conflict for pool {pool}: {message}")]
    Conflict {
        /// Pool being reconciled
        pool: String,
        /// Description of the conflict
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "runtime")
        context: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal("serialization", e.to_string())
    }
}

impl Error {
    /// Create an invalid-spec error for a pool
    pub fn invalid_spec(pool: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            pool: pool.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for a pool
    pub fn conflict(pool: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            pool: pool.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap a driver error with its pool and binding context
    pub fn driver(
        pool: impl Into<String>,
        ip: impl Into<String>,
        node: impl Into<String>,
        source: DriverError,
    ) -> Self {
        Self::Driver {
            pool: pool.into(),
            ip: ip.into(),
            node: node.into(),
            source,
        }
    }

    /// Reporting class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ErrorKind::Auth,
                kube::Error::Api(ae) if ae.code == 409 => ErrorKind::Conflict,
                _ => ErrorKind::Transient,
            },
            Error::Driver { source, .. } => source.kind(),
            Error::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the next tick should retry
    ///
    /// Everything retries except a rejected spec, which only changes when the
    /// operator edits the resource.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::InvalidSpec
    }

    /// Pool name if this error is associated with a specific pool
    pub fn pool(&self) -> Option<&str> {
        match self {
            Error::Driver { pool, .. }
            | Error::InvalidSpec { pool, .. }
            | Error::Conflict { pool, .. } => Some(pool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Classification During Reconciliation
    // ==========================================================================
    //
    // The reconciler never retries inline; it classifies the failure, reports
    // it and lets the next tick start from scratch. These tests pin down the
    // classification each failure mode receives.

    /// Story: a rejected pool spec is not retried until the spec changes
    ///
    /// When an operator creates a pool with a duplicate IP or both workload
    /// references, the pool is marked unhealthy and skipped. Retrying would
    /// burn API quota without any chance of success.
    #[test]
    fn story_invalid_spec_is_not_retryable() {
        let err = Error::invalid_spec("public-pool", "duplicate reserved IP 34.1.1.1");
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);
        assert!(!err.is_retryable());
        assert_eq!(err.pool(), Some("public-pool"));
        assert!(err.to_string().contains("duplicate reserved IP"));
    }

    /// Story: a leaked IP aborts the tick as a conflict and retries later
    ///
    /// When the cloud reports a reserved IP attached to an instance outside
    /// the pool's nodes, the driver must not steal it. The tick aborts with
    /// `conflict` and the next tick re-evaluates from scratch.
    #[test]
    fn story_leaked_ip_is_a_retryable_conflict() {
        let err = Error::driver(
            "public-pool",
            "34.1.1.1",
            "node-a",
            DriverError::InUseElsewhere("34.1.1.1 held by another instance".into()),
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("34.1.1.1"));
        assert!(err.to_string().contains("node-a"));
    }

    /// Story: credential failures are surfaced as their own kind
    ///
    /// Auth errors usually mean workload identity is misconfigured. They get
    /// a distinct `error_type` so alerts can route differently from plain
    /// cloud flakiness, but they still retry - tokens rotate.
    #[test]
    fn story_auth_errors_have_their_own_kind() {
        let err = Error::driver(
            "public-pool",
            "",
            "node-a",
            DriverError::Auth("metadata server returned 403".into()),
        );
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.is_retryable());
    }

    /// Story: cloud 5xx and transport failures retry on the next tick
    #[test]
    fn story_transient_cloud_errors_retry() {
        let err = Error::driver(
            "public-pool",
            "34.1.1.2",
            "node-b",
            DriverError::Transient("502 Bad Gateway".into()),
        );
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    /// Story: Kubernetes API status codes map onto the taxonomy
    #[test]
    fn story_kube_errors_classified_by_status_code() {
        fn api_error(code: u16) -> Error {
            Error::Kube {
                source: kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "denied".into(),
                    reason: "Forbidden".into(),
                    code,
                }),
            }
        }

        assert_eq!(api_error(403).kind(), ErrorKind::Auth);
        assert_eq!(api_error(401).kind(), ErrorKind::Auth);
        assert_eq!(api_error(409).kind(), ErrorKind::Conflict);
        assert_eq!(api_error(500).kind(), ErrorKind::Transient);
        assert_eq!(api_error(404).kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_kind_label_values() {
        assert_eq!(ErrorKind::Transient.as_str(), "transient");
        assert_eq!(ErrorKind::Auth.as_str(), "auth");
        assert_eq!(ErrorKind::Conflict.as_str(), "conflict");
        assert_eq!(ErrorKind::InvalidSpec.as_str(), "invalid_spec");
        assert_eq!(ErrorKind::Internal.as_str(), "internal");
    }

    #[test]
    fn test_internal_error_carries_context() {
        let err = Error::internal("reconciler", "node vanished mid-plan");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("[reconciler]"));
        assert_eq!(err.pool(), None);
    }
}
