//! Error types for kubebuild
//!
//! Errors carry the resource name and the attempted action so a failure can be
//! diagnosed from the message alone. The [`classify`] function is the single
//! place that decides whether an error is a benign bootstrap race, a "builder
//! not running yet" condition, or fatal.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Message fragments the API server uses when two actors race on a resource
const BENIGN_RACE_FRAGMENTS: &[&str] = &["already exists", "not found", "does not match"];

/// Structured API reasons equivalent to [`BENIGN_RACE_FRAGMENTS`]
const BENIGN_RACE_REASONS: &[&str] = &["AlreadyExists", "NotFound", "Conflict"];

/// Main error type for kubebuild operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The builder has no ready endpoint to connect to yet
    #[error("driver not running")]
    NotRunning,

    /// Another connection attempt on this driver is already in flight
    #[error("driver not connecting")]
    NotConnecting,

    /// A probe or builder pod failed to start
    #[error("pod {pod}: {message}")]
    Probe {
        /// Name of the pod being watched
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// Scaling a builder deployment failed
    #[error("scale error for {deployment}: {message}")]
    Scale {
        /// Name of the deployment being scaled
        deployment: String,
        /// Description of what failed
        message: String,
    },

    /// Bootstrapping a builder failed
    #[error("bootstrap error for {builder}: {message}")]
    Bootstrap {
        /// Name of the builder being bootstrapped
        builder: String,
        /// Description of what failed
        message: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled: {context}")]
    Cancelled {
        /// What was in progress when cancellation was observed
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "exec", "registry_auth")
        context: String,
    },
}

impl Error {
    /// Create a probe error for the named pod
    pub fn probe(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Probe {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a scale error for the named deployment
    pub fn scale(deployment: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Scale {
            deployment: deployment.into(),
            message: msg.into(),
        }
    }

    /// Create a bootstrap error for the named builder
    pub fn bootstrap(builder: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            builder: builder.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error describing what was interrupted
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }

    /// Whether this error came from a cancelled operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// How the bootstrap loop should react to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Two actors raced on the same resource; retry after a short jitter
    BenignRace,
    /// The builder has no reachable endpoint yet; re-check status and retry
    NotRunning,
    /// Anything else; return it to the caller
    Fatal,
}

/// Classify an error for the bootstrap retry protocol.
///
/// Structured API reasons are checked first, then the message text, so
/// errors that have been flattened to strings by a driver still classify.
pub fn classify(err: &Error) -> Disposition {
    match err {
        Error::NotRunning => return Disposition::NotRunning,
        Error::Cancelled { .. } | Error::NotConnecting => return Disposition::Fatal,
        Error::Kube {
            source: kube::Error::Api(resp),
        } if BENIGN_RACE_REASONS.contains(&resp.reason.as_str()) => {
            return Disposition::BenignRace
        }
        _ => {}
    }

    let msg = err.to_string();
    if BENIGN_RACE_FRAGMENTS.iter().any(|f| msg.contains(f)) {
        Disposition::BenignRace
    } else {
        Disposition::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn already_exists_message_is_benign() {
        let err = Error::bootstrap("b", "deployments.apps \"b\" already exists");
        assert_eq!(classify(&err), Disposition::BenignRace);
    }

    #[test]
    fn version_mismatch_message_is_benign() {
        let err = Error::internal("resourceVersion does not match");
        assert_eq!(classify(&err), Disposition::BenignRace);
    }

    #[test]
    fn structured_conflict_is_benign() {
        let err = api_error(409, "Conflict", "the object has been modified");
        assert_eq!(classify(&err), Disposition::BenignRace);
    }

    #[test]
    fn not_running_is_distinguished() {
        assert_eq!(classify(&Error::NotRunning), Disposition::NotRunning);
        assert_eq!(classify(&Error::NotConnecting), Disposition::Fatal);
    }

    #[test]
    fn other_errors_are_fatal() {
        let err = api_error(403, "Forbidden", "pods is forbidden");
        assert_eq!(classify(&err), Disposition::Fatal);
        assert_eq!(classify(&Error::cancelled("boot")), Disposition::Fatal);
    }

    #[test]
    fn not_found_detection() {
        assert!(api_error(404, "NotFound", "gone").is_not_found());
        assert!(!Error::internal("gone").is_not_found());
    }
}
