//! `kubebuild stop` and `kubebuild rm`

use clap::Args;
use tracing::info;

use kubebuild_driver::Driver;

use super::{cancel_on_ctrl_c, connect, BuilderArgs};
use crate::Result;

/// Scale a builder down to zero replicas
#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,

    /// Don't wait for the builder pods to go away
    #[arg(long, default_value = "false")]
    pub force: bool,
}

/// Delete a builder
#[derive(Args, Debug)]
pub struct RmArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,

    /// Delete immediately and ignore a builder that is already gone
    #[arg(long, default_value = "false")]
    pub force: bool,
}

pub async fn run_stop(args: StopArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, settings) = connect(&args.builder, None, false).await?;
    driver.stop(&ctx, args.force).await?;
    info!(builder = %settings.name, "builder stopped");
    println!("Builder '{}' stopped.", settings.name);
    Ok(())
}

pub async fn run_rm(args: RmArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, settings) = connect(&args.builder, None, false).await?;
    driver.rm(&ctx, args.force).await?;
    info!(builder = %settings.name, "builder removed");
    println!("Builder '{}' removed.", settings.name);
    Ok(())
}
