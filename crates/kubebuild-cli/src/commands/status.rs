//! `kubebuild status` and `kubebuild ls`

use clap::Args;

use kubebuild_driver::{Driver, Node};

use super::{cancel_on_ctrl_c, connect, BuilderArgs};
use crate::Result;

/// Show a builder and its endpoints
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, settings) = connect(&args.builder, None, false).await?;
    let info = driver.info(&ctx).await?;

    println!("Name:       {}", settings.name);
    println!("Namespace:  {}", driver.config().namespace);
    println!("Status:     {}", info.status);
    if !info.dynamic_nodes.is_empty() {
        println!("Endpoints:");
        for node in &info.dynamic_nodes {
            println!("  {}", node_line(node));
        }
    }
    Ok(())
}

pub async fn run_ls(args: StatusArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, _) = connect(&args.builder, None, false).await?;

    println!("{:<24} {:<12} ENDPOINTS", "NAME", "DRIVER");
    for builder in driver.list(&ctx).await? {
        println!("{:<24} {:<12} {}", builder.name, builder.driver, builder.nodes.len());
        for node in &builder.nodes {
            println!("  {}", node_line(node));
        }
    }
    Ok(())
}

fn node_line(node: &Node) -> String {
    let platforms: Vec<String> = node.platforms.iter().map(ToString::to_string).collect();
    if platforms.is_empty() {
        format!("{} ({})", node.name, node.status)
    } else {
        format!("{} ({}) {}", node.name, node.status, platforms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubebuild_driver::Platform;

    #[test]
    fn node_line_lists_platforms() {
        let mut node = Node {
            name: "ci-7d9f-abc".to_string(),
            status: "running".to_string(),
            platforms: vec![],
        };
        assert_eq!(node_line(&node), "ci-7d9f-abc (running)");

        node.platforms = vec![
            Platform {
                os: "linux".to_string(),
                architecture: "amd64".to_string(),
                variant: None,
            },
            Platform {
                os: "linux".to_string(),
                architecture: "arm".to_string(),
                variant: Some("v7".to_string()),
            },
        ];
        assert_eq!(
            node_line(&node),
            "ci-7d9f-abc (running) linux/amd64,linux/arm/v7"
        );
    }
}
