//! Common types for kubebuild: errors, cancellation-aware waiting and
//! Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;

pub use error::{classify, Disposition, Error};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key selecting the pods of a builder deployment
pub const BUILDER_LABEL_KEY: &str = "app";

/// Driver name reported for cluster-hosted builders
pub const KUBERNETES_DRIVER: &str = "kubernetes";

/// Default buildkitd image for new builders
pub const DEFAULT_BUILDKIT_IMAGE: &str = "docker.io/moby/buildkit:buildx-stable-1";
