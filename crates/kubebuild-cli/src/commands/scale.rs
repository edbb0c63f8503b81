//! `kubebuild scale` - one builder replica per ready node

use clap::Args;

use super::{cancel_on_ctrl_c, connect, BuilderArgs};
use crate::Result;

/// Scale a builder to one replica per ready node
#[derive(Args, Debug)]
pub struct ScaleArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,
}

pub async fn run(args: ScaleArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, settings) = connect(&args.builder, None, false).await?;
    driver.scale_to_nodes(&ctx).await?;
    println!("Builder '{}' scaled.", settings.name);
    Ok(())
}
