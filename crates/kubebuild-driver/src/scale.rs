//! Fleet scaling: one builder replica per ready cluster node
//!
//! A builder deployment is scaled to the number of ready nodes when there is
//! more than one, then watched until enough replicas report ready. On timeout
//! the new replica count is left in place; a slow cluster may still converge.

use std::time::Duration;

use k8s_openapi::api::autoscaling::v1::ScaleSpec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubebuild_common::kube_utils::is_node_ready;
use kubebuild_common::retry::{cancellable, sleep_or_cancel};
use kubebuild_common::{Error, Result};

use crate::kube_client::KubeClient;

/// Polling budget for scale convergence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleConfig {
    /// Maximum number of readiness checks
    pub max_polls: u32,
    /// Fixed delay before each check
    pub poll_interval: Duration,
    /// Checks to stay quiet for before logging progress
    pub quiet_polls: u32,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            max_polls: 100,
            poll_interval: Duration::from_millis(250),
            quiet_polls: 50,
        }
    }
}

/// Count nodes whose Ready condition is True.
///
/// Not-ready nodes are logged and skipped.
pub async fn ready_node_count(ctx: &CancellationToken, client: &dyn KubeClient) -> Result<i32> {
    let nodes = cancellable(ctx, "list nodes", client.list_nodes()).await?;
    let mut ready = 0;
    for node in &nodes {
        if is_node_ready(node) {
            ready += 1;
        } else {
            warn!(
                node = node.metadata.name.as_deref().unwrap_or_default(),
                "node not ready"
            );
        }
    }
    Ok(ready)
}

/// Scale `builder` up to the ready node count with the default budget
pub async fn maybe_scale_up(
    ctx: &CancellationToken,
    client: &dyn KubeClient,
    namespace: &str,
    builder: &str,
) -> Result<()> {
    maybe_scale_up_with(ctx, client, namespace, builder, &ScaleConfig::default()).await
}

/// Scale `builder` up to the ready node count when the cluster has more than
/// one ready node, and wait for the replicas to become ready.
pub async fn maybe_scale_up_with(
    ctx: &CancellationToken,
    client: &dyn KubeClient,
    namespace: &str,
    builder: &str,
    config: &ScaleConfig,
) -> Result<()> {
    let count = match ready_node_count(ctx, client).await {
        Ok(count) => count,
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => {
            error!(error = %e, "failed to list nodes");
            0
        }
    };
    if count <= 1 {
        debug!(builder, ready_nodes = count, "single node cluster, not scaling");
        return Ok(());
    }

    info!(builder, replicas = count, "scaling up builder");
    let mut scale = cancellable(ctx, "get scale", client.get_scale(namespace, builder))
        .await
        .inspect_err(|e| error!(builder, error = %e, "failed to read builder scale"))?;
    scale.spec = Some(ScaleSpec {
        replicas: Some(count),
    });
    cancellable(
        ctx,
        "update scale",
        client.replace_scale(namespace, builder, &scale),
    )
    .await
    .inspect_err(|e| error!(builder, error = %e, "failed to update builder scale"))?;

    info!(builder, replicas = count, "waiting for builder to scale up");
    for poll in 0..config.max_polls {
        sleep_or_cancel(ctx, config.poll_interval, "wait for builder scale up").await?;

        let deployment = cancellable(
            ctx,
            "get deployment",
            client.get_deployment(namespace, builder),
        )
        .await
        .inspect_err(|e| {
            error!(builder, error = %e, "failed to get builder deployment after scaling up")
        })?
        .ok_or_else(|| Error::scale(builder, "deployment disappeared while scaling up"))?;

        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready >= count {
            info!(builder, replicas = ready, "builder has scaled up");
            return Ok(());
        }
        if poll > config.quiet_polls {
            info!(builder, ready, desired = count, "builder hasn't scaled up yet");
        }
    }
    Err(Error::scale(builder, "builder failed to scale up"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
    use k8s_openapi::api::autoscaling::v1::Scale;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const NS: &str = "builds";
    const BUILDER: &str = "buildkit";

    fn node(name: &str, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(ready: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn fast() -> ScaleConfig {
        ScaleConfig {
            max_polls: 3,
            poll_interval: Duration::from_millis(1),
            quiet_polls: 1,
        }
    }

    #[tokio::test]
    async fn counts_only_ready_nodes() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes().returning(|| {
            Ok(vec![node("a", true), node("b", false), node("c", true)])
        });
        let ctx = CancellationToken::new();
        assert_eq!(ready_node_count(&ctx, &mock).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn single_ready_node_is_a_noop() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("a", true), node("b", false)]));
        mock.expect_get_scale().times(0);
        mock.expect_replace_scale().times(0);

        let ctx = CancellationToken::new();
        maybe_scale_up_with(&ctx, &mock, NS, BUILDER, &fast())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn node_list_failure_is_a_noop() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes()
            .returning(|| Err(Error::internal("nodes is forbidden")));
        mock.expect_replace_scale().times(0);

        let ctx = CancellationToken::new();
        maybe_scale_up_with(&ctx, &mock, NS, BUILDER, &fast())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn scales_to_node_count_and_converges_on_first_check() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok((0..4).map(|i| node(&format!("n{i}"), true)).collect()));
        mock.expect_get_scale()
            .withf(|ns, name| ns == NS && name == BUILDER)
            .times(1)
            .returning(|_, _| Ok(Scale::default()));
        mock.expect_replace_scale()
            .withf(|_, name, scale| {
                name == BUILDER && scale.spec.as_ref().and_then(|s| s.replicas) == Some(4)
            })
            .times(1)
            .returning(|_, _, scale| Ok(scale.clone()));
        mock.expect_get_deployment()
            .times(1)
            .returning(|_, _| Ok(Some(deployment(4))));

        let ctx = CancellationToken::new();
        maybe_scale_up_with(&ctx, &mock, NS, BUILDER, &fast())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_replicas_in_place() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("a", true), node("b", true)]));
        mock.expect_get_scale().returning(|_, _| Ok(Scale::default()));
        mock.expect_replace_scale()
            .times(1)
            .returning(|_, _, scale| Ok(scale.clone()));
        mock.expect_get_deployment()
            .times(100)
            .returning(|_, _| Ok(Some(deployment(1))));

        let ctx = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let err = maybe_scale_up(&ctx, &mock, NS, BUILDER).await.unwrap_err();
        assert!(err.to_string().contains("builder failed to scale up"), "{err}");
        assert!(start.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_convergence_wait() {
        let ctx = CancellationToken::new();
        let trigger = ctx.clone();

        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("a", true), node("b", true), node("c", true)]));
        mock.expect_get_scale().returning(|_, _| Ok(Scale::default()));
        mock.expect_replace_scale()
            .times(1)
            .returning(move |_, _, scale| {
                // Fires inside the first 250ms wait
                let trigger = trigger.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    trigger.cancel();
                });
                Ok(scale.clone())
            });
        mock.expect_get_deployment().times(0);

        let start = tokio::time::Instant::now();
        let err = maybe_scale_up(&ctx, &mock, NS, BUILDER).await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn scale_write_failure_is_fatal() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("a", true), node("b", true)]));
        mock.expect_get_scale().returning(|_, _| Ok(Scale::default()));
        mock.expect_replace_scale()
            .returning(|_, _, _| Err(Error::internal("admission webhook denied")));
        mock.expect_get_deployment().times(0);

        let ctx = CancellationToken::new();
        assert!(maybe_scale_up_with(&ctx, &mock, NS, BUILDER, &fast())
            .await
            .is_err());
    }
}
