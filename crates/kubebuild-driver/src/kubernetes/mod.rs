//! Kubernetes-hosted buildkit builders
//!
//! A builder is a Deployment of buildkitd pods labelled `app=<name>`. Status is
//! read from that Deployment on every call; nothing about it is cached here.

mod manifest;

pub use manifest::{
    builder_deployment, builder_labels, derive_status, endpoint_from_pod, node_platform,
    BUILDKITD_CONTAINER,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::ScaleSpec;
use k8s_openapi::api::core::v1::Pod;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use kubebuild_common::kube_utils::{is_pod_ready, label_selector};
use kubebuild_common::retry::{cancellable, sleep_or_cancel};
use kubebuild_common::{Error, Result, DEFAULT_BUILDKIT_IMAGE, KUBERNETES_DRIVER};

use crate::auth::{RegistryAuth, DOCKER_CONFIG_KEY};
use crate::driver::{
    BoxedStream, BuildEngineConnection, Builder, Driver, DriverInfo, DriverStatus, Feature, Node,
};
use crate::events::{pod_event_selector, EventReporter};
use crate::kube_client::KubeClient;
use crate::probe::{run_probe_with, ProbeConfig};
use crate::progress::ProgressWriter;
use crate::scale::{maybe_scale_up_with, ScaleConfig};

/// Default container runtime socket proxied by `runtime_sock_proxy`
pub const DEFAULT_RUNTIME_SOCKET: &str = "/run/containerd/containerd.sock";

/// Settings for one Kubernetes-hosted builder
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Builder name; also the Deployment name and `app` label value
    pub name: String,
    /// Namespace the builder lives in
    pub namespace: String,
    /// buildkitd image
    pub image: String,
    /// Replicas to create the Deployment with
    pub replicas: i32,
    /// Statically declared endpoints; disables endpoint discovery when set
    pub static_nodes: Vec<Node>,
    /// Scale to one replica per ready cluster node after bootstrap
    pub scale_to_nodes: bool,
    /// Runtime socket path inside builder pods
    pub runtime_socket: String,
    /// Polling budget for pod startup (rollout and probes)
    pub rollout: ProbeConfig,
    /// Polling budget for scale convergence
    pub scale: ScaleConfig,
}

impl DriverConfig {
    /// Default configuration for builder `name` in `namespace`
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: DEFAULT_BUILDKIT_IMAGE.to_string(),
            replicas: 1,
            static_nodes: Vec::new(),
            scale_to_nodes: false,
            runtime_socket: DEFAULT_RUNTIME_SOCKET.to_string(),
            rollout: ProbeConfig::default(),
            scale: ScaleConfig::default(),
        }
    }
}

/// [`Driver`] backed by a Deployment in a Kubernetes cluster
pub struct KubernetesDriver {
    client: Arc<dyn KubeClient>,
    config: DriverConfig,
    connecting: Mutex<()>,
}

impl KubernetesDriver {
    /// Create a driver for the configured builder
    pub fn new(client: Arc<dyn KubeClient>, config: DriverConfig) -> Self {
        Self {
            client,
            config,
            connecting: Mutex::new(()),
        }
    }

    /// The driver's configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Check that `image` is present and runnable on the cluster with a
    /// throwaway probe pod.
    pub async fn verify_image(&self, ctx: &CancellationToken, image: &str) -> Result<()> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        let name = format!("{}-probe-{}", self.config.name, suffix);
        run_probe_with(
            ctx,
            &self.client,
            &name,
            image,
            &self.config.namespace,
            &self.config.rollout,
        )
        .await
    }

    /// Scale the builder to one replica per ready node
    pub async fn scale_to_nodes(&self, ctx: &CancellationToken) -> Result<()> {
        maybe_scale_up_with(
            ctx,
            self.client.as_ref(),
            &self.config.namespace,
            &self.config.name,
            &self.config.scale,
        )
        .await
    }

    /// Print the logs of all builder pods to `out`
    pub async fn dump_logs<W: std::io::Write>(&self, ctx: &CancellationToken, out: &mut W) -> usize {
        crate::logs::log_builder_logs(
            ctx,
            self.client.as_ref(),
            &self.config.name,
            &self.config.namespace,
            out,
        )
        .await
    }

    fn selector(&self) -> String {
        label_selector(&builder_labels(&self.config.name))
    }

    async fn builder_pods(&self, ctx: &CancellationToken) -> Result<Vec<Pod>> {
        cancellable(
            ctx,
            "list builder pods",
            self.client.list_pods(&self.config.namespace, &self.selector()),
        )
        .await
    }

    async fn ready_pods(&self, ctx: &CancellationToken) -> Result<Vec<String>> {
        Ok(self
            .builder_pods(ctx)
            .await?
            .iter()
            .filter(|p| is_pod_ready(p))
            .filter_map(|p| p.metadata.name.clone())
            .collect())
    }

    async fn dynamic_nodes(&self, ctx: &CancellationToken) -> Result<Vec<Node>> {
        let pods = self.builder_pods(ctx).await?;
        if pods.is_empty() {
            return Ok(Vec::new());
        }
        let nodes = cancellable(ctx, "list nodes", self.client.list_nodes()).await?;
        Ok(pods.iter().map(|p| endpoint_from_pod(p, &nodes)).collect())
    }

    async fn set_replicas(&self, ctx: &CancellationToken, replicas: i32) -> Result<()> {
        let ns = &self.config.namespace;
        let name = &self.config.name;
        let mut scale = cancellable(ctx, "get scale", self.client.get_scale(ns, name)).await?;
        scale.spec = Some(ScaleSpec {
            replicas: Some(replicas),
        });
        cancellable(
            ctx,
            "update scale",
            self.client.replace_scale(ns, name, &scale),
        )
        .await?;
        Ok(())
    }

    async fn do_bootstrap(&self, ctx: &CancellationToken) -> Result<()> {
        let ns = &self.config.namespace;
        let name = &self.config.name;

        let existing = cancellable(
            ctx,
            "get builder deployment",
            self.client.get_deployment(ns, name),
        )
        .await?;
        match derive_status(existing.as_ref()) {
            DriverStatus::Running => {
                debug!(builder = %name, "builder already running");
                return Ok(());
            }
            DriverStatus::Inactive => {
                info!(builder = %name, image = %self.config.image, "creating builder deployment");
                let deployment =
                    builder_deployment(name, ns, &self.config.image, self.config.replicas);
                cancellable(
                    ctx,
                    "create builder deployment",
                    self.client.create_deployment(ns, &deployment),
                )
                .await?;
            }
            DriverStatus::Stopped => {
                info!(builder = %name, replicas = self.config.replicas, "starting stopped builder");
                self.set_replicas(ctx, self.config.replicas).await?;
            }
            DriverStatus::Starting | DriverStatus::Stopping => {}
        }

        self.wait_for_rollout(ctx).await?;

        if self.config.scale_to_nodes {
            self.scale_to_nodes(ctx).await?;
        }
        Ok(())
    }

    /// Wait for at least one builder replica to become ready, failing fast on
    /// pod events that can never resolve.
    async fn wait_for_rollout(&self, ctx: &CancellationToken) -> Result<()> {
        let ns = &self.config.namespace;
        let name = &self.config.name;
        let budget = &self.config.rollout;
        let mut reporter = EventReporter::new();

        info!(builder = %name, "waiting for builder pods to become ready");
        for poll in 0..budget.max_polls {
            for pod in self.builder_pods(ctx).await? {
                let events = cancellable(
                    ctx,
                    "list builder pod events",
                    self.client.list_events(ns, &pod_event_selector(&pod)),
                )
                .await?;
                reporter.observe(&events, pod.metadata.uid.as_deref())?;
            }

            sleep_or_cancel(ctx, budget.delay(poll), "wait for builder rollout").await?;

            let deployment = cancellable(
                ctx,
                "get builder deployment",
                self.client.get_deployment(ns, name),
            )
            .await?
            .ok_or_else(|| {
                // Another client removed the builder under us; "not found"
                // lets the bootstrap loop retry.
                Error::bootstrap(name, format!("deployment {} not found", name))
            })?;
            if derive_status(Some(&deployment)) == DriverStatus::Running {
                info!(builder = %name, "builder is ready");
                return Ok(());
            }
        }
        Err(Error::bootstrap(name, "builder pods never became ready"))
    }

    async fn wait_for_stop(&self, ctx: &CancellationToken) -> Result<()> {
        let ns = &self.config.namespace;
        let name = &self.config.name;
        let budget = &self.config.rollout;

        for poll in 0..budget.max_polls {
            let deployment = cancellable(
                ctx,
                "get builder deployment",
                self.client.get_deployment(ns, name),
            )
            .await?;
            if derive_status(deployment.as_ref()) != DriverStatus::Running {
                return Ok(());
            }
            sleep_or_cancel(ctx, budget.delay(poll), "wait for builder stop").await?;
        }
        Err(Error::internal_with_context(
            "stop",
            format!("builder {} replicas never stopped", name),
        ))
    }
}

#[async_trait]
impl Driver for KubernetesDriver {
    fn builder_name(&self) -> String {
        self.config.name.clone()
    }

    #[instrument(skip(self, ctx, progress), fields(builder = %self.config.name))]
    async fn bootstrap(&self, ctx: &CancellationToken, progress: &ProgressWriter) -> Result<()> {
        let step = progress.step(
            format!("bootstrap/{}", self.config.name),
            format!("booting buildkit builder {}", self.config.name),
        );
        let result = self.do_bootstrap(ctx).await;
        step.finish(&result);
        result
    }

    async fn info(&self, ctx: &CancellationToken) -> Result<DriverInfo> {
        let deployment = cancellable(
            ctx,
            "get builder deployment",
            self.client
                .get_deployment(&self.config.namespace, &self.config.name),
        )
        .await?;
        let status = derive_status(deployment.as_ref());

        let dynamic_nodes = if self.config.static_nodes.is_empty() && deployment.is_some() {
            self.dynamic_nodes(ctx).await?
        } else {
            Vec::new()
        };
        Ok(DriverInfo {
            status,
            dynamic_nodes,
        })
    }

    async fn stop(&self, ctx: &CancellationToken, force: bool) -> Result<()> {
        let deployment = cancellable(
            ctx,
            "get builder deployment",
            self.client
                .get_deployment(&self.config.namespace, &self.config.name),
        )
        .await?;
        if deployment.is_none() {
            debug!(builder = %self.config.name, "builder not present, nothing to stop");
            return Ok(());
        }

        info!(builder = %self.config.name, force, "stopping builder");
        self.set_replicas(ctx, 0).await?;
        if force {
            return Ok(());
        }
        self.wait_for_stop(ctx).await
    }

    async fn rm(&self, ctx: &CancellationToken, force: bool) -> Result<()> {
        info!(builder = %self.config.name, force, "removing builder");
        let result = cancellable(
            ctx,
            "delete builder deployment",
            self.client
                .delete_deployment(&self.config.namespace, &self.config.name, force),
        )
        .await;
        match result {
            Err(e) if force && e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn client(&self, ctx: &CancellationToken) -> Result<(BuildEngineConnection, String)> {
        let _guard = self.connecting.try_lock().map_err(|_| Error::NotConnecting)?;

        let ready = self.ready_pods(ctx).await?;
        let chosen = {
            let mut rng = rand::thread_rng();
            ready.choose(&mut rng).cloned()
        };
        let pod = chosen.ok_or(Error::NotRunning)?;

        debug!(builder = %self.config.name, pod = %pod, "dialing buildkitd");
        let stream = cancellable(
            ctx,
            "dial buildkitd",
            self.client.exec_stream(
                &self.config.namespace,
                &pod,
                BUILDKITD_CONTAINER,
                vec!["buildctl".to_string(), "dial-stdio".to_string()],
            ),
        )
        .await?;
        Ok((
            BuildEngineConnection {
                endpoint: pod.clone(),
                stream,
            },
            pod,
        ))
    }

    fn features(&self) -> BTreeMap<Feature, bool> {
        BTreeMap::from([
            (Feature::OciExporter, true),
            (Feature::DockerExporter, true),
            (Feature::CacheExport, true),
            (Feature::MultiPlatform, true),
        ])
    }

    async fn list(&self, ctx: &CancellationToken) -> Result<Vec<Builder>> {
        let nodes = if self.config.static_nodes.is_empty() {
            self.info(ctx).await?.dynamic_nodes
        } else {
            self.config.static_nodes.clone()
        };
        Ok(vec![Builder {
            name: self.config.name.clone(),
            driver: KUBERNETES_DRIVER.to_string(),
            nodes,
        }])
    }

    async fn runtime_sock_proxy(&self, ctx: &CancellationToken, name: &str) -> Result<BoxedStream> {
        cancellable(
            ctx,
            "proxy runtime socket",
            self.client.exec_stream(
                &self.config.namespace,
                name,
                BUILDKITD_CONTAINER,
                vec![
                    "socat".to_string(),
                    "-".to_string(),
                    format!("UNIX-CONNECT:{}", self.config.runtime_socket),
                ],
            ),
        )
        .await
    }

    async fn version(&self, ctx: &CancellationToken) -> Result<String> {
        let pod = self
            .ready_pods(ctx)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NotRunning)?;
        let output = cancellable(
            ctx,
            "get buildkitd version",
            self.client.exec_output(
                &self.config.namespace,
                &pod,
                BUILDKITD_CONTAINER,
                vec!["buildkitd".to_string(), "--version".to_string()],
            ),
        )
        .await?;
        Ok(output.trim().to_string())
    }

    async fn registry_auth(
        &self,
        ctx: &CancellationToken,
        secret_name: &str,
    ) -> Result<RegistryAuth> {
        let secret = cancellable(
            ctx,
            "get registry secret",
            self.client.get_secret(&self.config.namespace, secret_name),
        )
        .await?
        .ok_or_else(|| {
            Error::internal_with_context(
                "registry_auth",
                format!(
                    "secret {} not found in namespace {}",
                    secret_name, self.config.namespace
                ),
            )
        })?;

        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_KEY))
            .ok_or_else(|| {
                Error::internal_with_context(
                    "registry_auth",
                    format!("secret {} has no {} key", secret_name, DOCKER_CONFIG_KEY),
                )
            })?;
        RegistryAuth::from_docker_config(&data.0)
    }

    fn auth_hint_message(&self) -> String {
        format!(
            "store registry credentials with `kubectl create secret docker-registry <name> \
             --namespace {}` and pass the secret name with --registry-secret",
            self.config.namespace
        )
    }
}
