//! Driver contract: a way to run a buildkit engine somewhere.
//!
//! `boot` only ever talks to a [`Driver`], so a new backend slots in without
//! touching the retry protocol.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use kubebuild_common::Result;

use crate::auth::RegistryAuth;
use crate::progress::ProgressWriter;

/// Lifecycle state of a driver's backend, derived from live cluster state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    /// No backend resources exist
    Inactive,
    /// Resources exist but no endpoint is ready yet
    Starting,
    /// At least one endpoint is ready
    Running,
    /// Resources are being deleted
    Stopping,
    /// Resources exist but are scaled to zero
    Stopped,
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverStatus::Inactive => "inactive",
            DriverStatus::Starting => "starting",
            DriverStatus::Running => "running",
            DriverStatus::Stopping => "stopping",
            DriverStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Result of [`Driver::info`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverInfo {
    /// Current backend status
    pub status: DriverStatus,
    /// Endpoints discovered from the cluster.
    ///
    /// Always empty when the builder was configured with static nodes.
    pub dynamic_nodes: Vec<Node>,
}

/// Target platform of a build endpoint
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Platform {
    /// Operating system (e.g. "linux")
    pub os: String,
    /// CPU architecture (e.g. "amd64")
    pub architecture: String,
    /// Architecture variant (e.g. "v7")
    pub variant: Option<String>,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// One build-capable endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Endpoint name (the builder pod name for dynamic nodes)
    pub name: String,
    /// Free-form status text
    pub status: String,
    /// Platforms this endpoint can build for
    pub platforms: Vec<Platform>,
}

/// A named, listable build target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Builder {
    /// Builder name
    pub name: String,
    /// Name of the driver hosting it
    pub driver: String,
    /// Endpoints of the builder
    pub nodes: Vec<Node>,
}

/// Optional build engine capabilities
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// Can export OCI image tarballs
    OciExporter,
    /// Can export docker image tarballs
    DockerExporter,
    /// Can export build cache
    CacheExport,
    /// Can build for multiple platforms in one request
    MultiPlatform,
}

/// Bidirectional byte stream to a remote process
pub trait EngineStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> EngineStream for T {}

/// Owned, type-erased [`EngineStream`]
pub type BoxedStream = Box<dyn EngineStream>;

/// Open connection to one buildkit endpoint
pub struct BuildEngineConnection {
    /// Endpoint this connection talks to
    pub endpoint: String,
    /// Raw stream carrying the buildkit API
    pub stream: BoxedStream,
}

impl fmt::Debug for BuildEngineConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildEngineConnection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Operations every buildkit-hosting backend supports.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name of the builder this driver manages
    fn builder_name(&self) -> String;

    /// Bring the backend from not running to running.
    ///
    /// Succeeds without side effects if the backend is already running.
    async fn bootstrap(&self, ctx: &CancellationToken, progress: &ProgressWriter) -> Result<()>;

    /// Query the current status from live cluster resources
    async fn info(&self, ctx: &CancellationToken) -> Result<DriverInfo>;

    /// Stop the backend, keeping its resources
    async fn stop(&self, ctx: &CancellationToken, force: bool) -> Result<()>;

    /// Remove the backend's resources
    async fn rm(&self, ctx: &CancellationToken, force: bool) -> Result<()>;

    /// Connect to one ready endpoint, returning the connection and the
    /// chosen endpoint name.
    ///
    /// Fails with `Error::NotRunning` when no endpoint is ready and
    /// `Error::NotConnecting` when another attempt is in flight.
    async fn client(&self, ctx: &CancellationToken) -> Result<(BuildEngineConnection, String)>;

    /// Capabilities of the backend
    fn features(&self) -> BTreeMap<Feature, bool>;

    /// List the builders this driver exposes
    async fn list(&self, ctx: &CancellationToken) -> Result<Vec<Builder>>;

    /// Open a raw stream to the container runtime socket of the named endpoint
    async fn runtime_sock_proxy(&self, ctx: &CancellationToken, name: &str) -> Result<BoxedStream>;

    /// Version string reported by the build engine
    async fn version(&self, ctx: &CancellationToken) -> Result<String>;

    /// Registry credentials stored in the named secret
    async fn registry_auth(&self, ctx: &CancellationToken, secret_name: &str)
        -> Result<RegistryAuth>;

    /// Hint shown to users when a registry rejects their credentials
    fn auth_hint_message(&self) -> String;
}
