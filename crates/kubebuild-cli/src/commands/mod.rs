//! CLI commands

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubebuild_common::kube_utils::create_client;
use kubebuild_driver::progress::ProgressEvent;
use kubebuild_driver::{DriverConfig, KubeClientImpl, KubernetesDriver};

use crate::config::{self, BuilderSettings, Overrides};
use crate::Result;

pub mod bootstrap;
pub mod logs;
pub mod remove;
pub mod scale;
pub mod status;
pub mod verify_image;
pub mod version;

/// Options selecting a builder, shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct BuilderArgs {
    /// Builder name
    #[arg(long)]
    pub name: Option<String>,

    /// Namespace the builder lives in
    #[arg(long, env = "KUBEBUILD_NAMESPACE")]
    pub namespace: Option<String>,

    /// buildkitd image for new builders
    #[arg(long, env = "KUBEBUILD_IMAGE")]
    pub image: Option<String>,

    /// Path to kubeconfig
    #[arg(long, env = "KUBEBUILD_KUBECONFIG")]
    pub kubeconfig: Option<String>,
}

impl BuilderArgs {
    fn overrides(&self, replicas: Option<i32>) -> Overrides {
        Overrides {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            kubeconfig: self.kubeconfig.clone(),
            replicas,
        }
    }
}

/// Resolve settings and build a driver connected to the cluster.
pub async fn connect(
    args: &BuilderArgs,
    replicas: Option<i32>,
    scale_to_nodes: bool,
) -> Result<(KubernetesDriver, BuilderSettings)> {
    let settings = config::load_config()?.resolve(&args.overrides(replicas))?;
    let (client, default_namespace) = create_client(settings.kubeconfig.as_deref()).await?;
    let namespace = settings
        .namespace
        .clone()
        .unwrap_or(default_namespace);
    debug!(builder = %settings.name, namespace = %namespace, "using builder");

    let mut driver_config = DriverConfig::new(&settings.name, namespace);
    driver_config.image = settings.image.clone();
    driver_config.replicas = settings.replicas;
    driver_config.runtime_socket = settings.runtime_socket.clone();
    driver_config.scale_to_nodes = scale_to_nodes;
    let driver = KubernetesDriver::new(Arc::new(KubeClientImpl::new(client)), driver_config);
    Ok((driver, settings))
}

/// Token cancelled on Ctrl-C so in-flight waits stop and probe pods are cleaned up
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, cancelling");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });
    token
}

/// Fresh token for post-failure diagnostics, cancelled after `budget`.
///
/// Independent of the command's token, which is already cancelled when the
/// failure came from Ctrl-C.
pub fn diagnostics_token(budget: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let deadline = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(budget).await;
        deadline.cancel();
    });
    token
}

/// Render a progress event as a single status line
pub fn progress_line(event: &ProgressEvent) -> String {
    match (event.completed, &event.error) {
        (false, _) => format!("[+] {} ...", event.name),
        (true, None) => format!("[+] {} done", event.name),
        (true, Some(e)) => format!("[!] {} failed: {}", event.name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(completed: bool, error: Option<&str>) -> ProgressEvent {
        ProgressEvent {
            id: "bootstrap/ci".to_string(),
            name: "booting buildkit builder ci".to_string(),
            started: true,
            completed,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn progress_lines() {
        assert_eq!(
            progress_line(&event(false, None)),
            "[+] booting buildkit builder ci ..."
        );
        assert_eq!(
            progress_line(&event(true, None)),
            "[+] booting buildkit builder ci done"
        );
        assert_eq!(
            progress_line(&event(true, Some("boom"))),
            "[!] booting buildkit builder ci failed: boom"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostics_outlive_an_interrupted_command() {
        let interrupted = CancellationToken::new();
        interrupted.cancel();

        let diagnostics = diagnostics_token(Duration::from_secs(30));
        assert!(!diagnostics.is_cancelled());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!diagnostics.is_cancelled());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(diagnostics.is_cancelled());
    }

    #[test]
    fn overrides_carry_flags() {
        let args = BuilderArgs {
            name: Some("ci".to_string()),
            kubeconfig: Some("/tmp/kc".to_string()),
            ..Default::default()
        };
        let o = args.overrides(Some(3));
        assert_eq!(o.name.as_deref(), Some("ci"));
        assert_eq!(o.kubeconfig.as_deref(), Some("/tmp/kc"));
        assert_eq!(o.replicas, Some(3));
        assert!(o.namespace.is_none());
    }
}
