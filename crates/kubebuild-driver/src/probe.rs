//! Probe pod lifecycle
//!
//! Validates that an image is resident and runnable in a namespace by starting
//! a throwaway pod with `imagePullPolicy: Never` and watching it. Unrecoverable
//! conditions fail fast instead of waiting out the budget, and the pod is
//! deleted on every exit path once it has been created.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubebuild_common::kube_utils::{pod_phase, POD_PHASE_RUNNING, POD_PHASE_SUCCEEDED};
use kubebuild_common::retry::{cancellable, sleep_or_cancel};
use kubebuild_common::{Error, Result};

use crate::events::{pod_event_selector, EventReporter};
use crate::kube_client::KubeClient;

/// Polling budget for pod startup watches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Maximum number of polls before giving up
    pub max_polls: u32,
    /// Delay after the first poll
    pub base_delay: Duration,
    /// Added to the delay on each subsequent poll
    pub delay_step: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_polls: 100,
            base_delay: Duration::from_millis(100),
            delay_step: Duration::from_millis(20),
        }
    }
}

impl ProbeConfig {
    /// Delay to wait after poll number `poll` (zero based)
    pub fn delay(&self, poll: u32) -> Duration {
        self.base_delay + self.delay_step * poll
    }
}

/// Manifest for a probe pod running `image`
pub fn probe_pod(name: &str, image: &str, namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "60".to_string()]),
                image_pull_policy: Some("Never".to_string()),
                ..Default::default()
            }],
            termination_grace_period_seconds: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Run a probe pod for `image` with the default polling budget
pub async fn run_probe(
    ctx: &CancellationToken,
    client: &Arc<dyn KubeClient>,
    name: &str,
    image: &str,
    namespace: &str,
) -> Result<()> {
    run_probe_with(ctx, client, name, image, namespace, &ProbeConfig::default()).await
}

/// Run a probe pod for `image` and wait until it is Running or Succeeded.
///
/// The pod is deleted however this returns. If the future is dropped before
/// completing, the delete is spawned onto the runtime instead.
pub async fn run_probe_with(
    ctx: &CancellationToken,
    client: &Arc<dyn KubeClient>,
    name: &str,
    image: &str,
    namespace: &str,
    config: &ProbeConfig,
) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::cancelled("create probe pod"));
    }

    info!(pod = name, image, "starting probe pod");
    // Armed before the request is sent: a create dropped in flight may still
    // leave a pod behind.
    let cleanup = PodCleanupGuard::new(client.clone(), namespace, name);
    // Not raced against cancellation: once the request is sent the pod may
    // exist, and it must be known here to be cleaned up.
    let pod = match client
        .create_pod(namespace, &probe_pod(name, image, namespace))
        .await
    {
        Ok(pod) => pod,
        Err(e) => {
            cleanup.disarm();
            return Err(e);
        }
    };

    let result = watch_probe(ctx, client.as_ref(), pod, namespace, config).await;

    // Cleanup is not cancellable.
    cleanup.delete().await;
    result
}

/// Deletes a probe pod when dropped without an explicit [`PodCleanupGuard::delete`]
struct PodCleanupGuard {
    client: Arc<dyn KubeClient>,
    namespace: String,
    name: String,
    armed: bool,
}

impl PodCleanupGuard {
    fn new(client: Arc<dyn KubeClient>, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    /// Delete the pod now. Stays armed until the request finishes so a drop
    /// mid-request still cleans up.
    async fn delete(mut self) {
        delete_probe_pod(self.client.as_ref(), &self.namespace, &self.name).await;
        self.armed = false;
    }
}

impl Drop for PodCleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let namespace = std::mem::take(&mut self.namespace);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    delete_probe_pod(client.as_ref(), &namespace, &name).await;
                });
            }
            Err(_) => warn!(pod = %name, "no runtime to clean up probe pod, leaking it"),
        }
    }
}

async fn delete_probe_pod(client: &dyn KubeClient, namespace: &str, name: &str) {
    if let Err(e) = client.delete_pod(namespace, name).await {
        warn!(pod = name, error = %e, "failed to clean up probe pod");
    }
}

async fn watch_probe(
    ctx: &CancellationToken,
    client: &dyn KubeClient,
    mut pod: Pod,
    namespace: &str,
    config: &ProbeConfig,
) -> Result<()> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let mut reporter = EventReporter::new();
    info!(pod = %name, "waiting for probe pod to start");

    for poll in 0..config.max_polls {
        let selector = pod_event_selector(&pod);
        let events = cancellable(
            ctx,
            "list probe pod events",
            client.list_events(namespace, &selector),
        )
        .await?;
        reporter.observe(&events, pod.metadata.uid.as_deref())?;

        sleep_or_cancel(ctx, config.delay(poll), "wait for probe pod").await?;

        pod = cancellable(ctx, "get probe pod", client.get_pod(namespace, &name)).await?;
        let phase = pod_phase(&pod);
        info!(pod = %name, phase, "probe pod phase");
        if phase == POD_PHASE_RUNNING || phase == POD_PHASE_SUCCEEDED {
            return Ok(());
        }
    }
    Err(Error::probe(name, "pod never started"))
}
