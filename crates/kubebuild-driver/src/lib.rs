//! Builder drivers for kubebuild
//!
//! A [`Driver`] runs a buildkit engine somewhere and hands out connections to
//! it. [`boot`] brings a driver up, tolerating concurrent bootstraps of the
//! same builder. The Kubernetes driver hosts builders as Deployments, verifies
//! images with probe pods and can scale a builder out to every ready node.

#![deny(missing_docs)]

pub mod auth;
pub mod boot;
pub mod driver;
pub mod events;
pub mod kube_client;
pub mod kubernetes;
pub mod logs;
pub mod probe;
pub mod progress;
pub mod scale;

pub use auth::{RegistryAuth, RegistryCredential};
pub use boot::{boot, MAX_BOOT_RETRIES};
pub use driver::{
    BoxedStream, BuildEngineConnection, Builder, Driver, DriverInfo, DriverStatus, EngineStream,
    Feature, Node, Platform,
};
pub use kube_client::{KubeClient, KubeClientImpl};
pub use kubernetes::{DriverConfig, KubernetesDriver};
pub use logs::log_builder_logs;
pub use probe::{run_probe, ProbeConfig};
pub use progress::{ProgressEvent, ProgressWriter};
pub use scale::{maybe_scale_up, ScaleConfig};
