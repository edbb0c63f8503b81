//! Kubernetes API surface used by the driver
//!
//! Every cluster call the driver makes goes through [`KubeClient`] so the
//! polling loops can be tested against a mock instead of a live cluster.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::{Event, Node, Pod, Secret};
use kube::api::{Api, AttachParams, AttachedProcess, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubebuild_common::{Error, Result};

use crate::driver::BoxedStream;

/// Trait abstracting Kubernetes client operations for builders
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Create a pod, returning the server's view of it
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Get a pod by name
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Delete a pod by name
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// List events matching a field selector
    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>>;

    /// List all cluster nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Get a deployment, or None if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create a deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;

    /// Delete a deployment.
    ///
    /// `force` deletes in the background with no grace period.
    async fn delete_deployment(&self, namespace: &str, name: &str, force: bool) -> Result<()>;

    /// Read the scale subresource of a deployment
    async fn get_scale(&self, namespace: &str, name: &str) -> Result<Scale>;

    /// Replace the scale subresource of a deployment
    async fn replace_scale(&self, namespace: &str, name: &str, scale: &Scale) -> Result<Scale>;

    /// Fetch a single snapshot of a pod's logs
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String>;

    /// Run a command in a container with stdin and stdout joined into one stream
    async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<BoxedStream>;

    /// Run a command in a container and collect its stdout
    async fn exec_output(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String>;

    /// Get a secret, or None if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self
            .pods(namespace)
            .create(&PostParams::default(), pod)
            .await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&lp).await?.items)
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(field_selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        Ok(self
            .deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str, force: bool) -> Result<()> {
        let dp = if force {
            DeleteParams::background().grace_period(0)
        } else {
            DeleteParams::foreground()
        };
        self.deployments(namespace).delete(name, &dp).await?;
        Ok(())
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> Result<Scale> {
        Ok(self.deployments(namespace).get_scale(name).await?)
    }

    async fn replace_scale(&self, namespace: &str, name: &str, scale: &Scale) -> Result<Scale> {
        let body = serde_json::to_vec(scale)
            .map_err(|e| Error::serialization(format!("failed to encode scale: {}", e)))?;
        Ok(self
            .deployments(namespace)
            .replace_scale(name, &PostParams::default(), body)
            .await?)
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        Ok(self
            .pods(namespace)
            .logs(name, &LogParams::default())
            .await?)
    }

    async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<BoxedStream> {
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(false);
        debug!(pod, container, ?command, "opening exec stream");

        let mut process = self.pods(namespace).exec(pod, command, &params).await?;
        let stdout = process
            .stdout()
            .ok_or_else(|| Error::internal_with_context("exec", "stdout not attached"))?;
        let stdin = process
            .stdin()
            .ok_or_else(|| Error::internal_with_context("exec", "stdin not attached"))?;

        Ok(Box::new(ExecStream {
            io: tokio::io::join(stdout, stdin),
            _process: Box::new(process),
        }))
    }

    async fn exec_output(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);

        let mut process = self.pods(namespace).exec(pod, command, &params).await?;
        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout.read_to_string(&mut output).await.map_err(|e| {
                Error::internal_with_context("exec", format!("failed to read output: {}", e))
            })?;
        }
        process
            .join()
            .await
            .map_err(|e| Error::internal_with_context("exec", e.to_string()))?;
        Ok(output)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Exec session exposed as a single duplex stream.
///
/// Holds the attached process so the session lives as long as the stream.
struct ExecStream<S> {
    io: S,
    _process: Box<AttachedProcess>,
}

impl<S: AsyncRead + Unpin> AsyncRead for ExecStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ExecStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
