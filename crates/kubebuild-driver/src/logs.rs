//! Builder log aggregation for diagnostics
//!
//! Lines are written to a plain writer instead of through `tracing` so dumps
//! embedded in leveled output don't carry doubled timestamps and levels.

use std::collections::BTreeMap;
use std::io::Write;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kubebuild_common::kube_utils::label_selector;
use kubebuild_common::retry::cancellable;
use kubebuild_common::BUILDER_LABEL_KEY;

use crate::kube_client::KubeClient;

/// Print a snapshot of the logs of every pod of builder `name` to `out`.
///
/// Each line is written as `pod="<pod>" <line>`. Failures are logged and
/// skipped per pod; this never fails. Returns the number of pods whose logs
/// were written.
pub async fn log_builder_logs<W: Write>(
    ctx: &CancellationToken,
    client: &dyn KubeClient,
    name: &str,
    namespace: &str,
    out: &mut W,
) -> usize {
    let selector = label_selector(&BTreeMap::from([(
        BUILDER_LABEL_KEY.to_string(),
        name.to_string(),
    )]));
    let pods = match cancellable(ctx, "list builder pods", client.list_pods(namespace, &selector))
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            warn!(builder = name, error = %e, "failed to get builder pods for logging");
            return 0;
        }
    };

    info!(builder = name, pods = pods.len(), "gathering builder logs");
    info!("--- BEGIN BUILDER LOGS ---");
    let mut dumped = 0;
    for pod in &pods {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let logs = match cancellable(ctx, "get pod logs", client.pod_logs(namespace, pod_name)).await
        {
            Ok(logs) => logs,
            Err(e) => {
                error!(pod = pod_name, error = %e, "failed to get logs");
                continue;
            }
        };
        for line in logs.lines() {
            if let Err(e) = writeln!(out, "pod=\"{}\" {}", pod_name, line) {
                warn!(error = %e, "failed to write builder logs");
                return dumped;
            }
        }
        dumped += 1;
    }
    info!("--- END BUILDER LOGS ---");
    dumped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubebuild_common::Error;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn prints_tagged_lines_and_skips_failed_pods() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_pods()
            .withf(|ns, selector| ns == "builds" && selector == "app=buildkit")
            .returning(|_, _| Ok(vec![pod("b-0"), pod("b-1"), pod("b-2")]));
        mock.expect_pod_logs()
            .times(3)
            .returning(|_, name| match name {
                "b-1" => Err(Error::internal("container not found")),
                other => Ok(format!("starting {other}\nready\n")),
            });

        let ctx = CancellationToken::new();
        let mut out = Vec::new();
        let dumped = log_builder_logs(&ctx, &mock, "buildkit", "builds", &mut out).await;

        assert_eq!(dumped, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "pod=\"b-0\" starting b-0\n\
             pod=\"b-0\" ready\n\
             pod=\"b-2\" starting b-2\n\
             pod=\"b-2\" ready\n"
        );
    }

    #[tokio::test]
    async fn pod_list_failure_prints_nothing() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_pods()
            .returning(|_, _| Err(Error::internal("pods is forbidden")));
        mock.expect_pod_logs().times(0);

        let ctx = CancellationToken::new();
        let mut out = Vec::new();
        assert_eq!(
            log_builder_logs(&ctx, &mock, "buildkit", "builds", &mut out).await,
            0
        );
        assert!(out.is_empty());
    }
}
