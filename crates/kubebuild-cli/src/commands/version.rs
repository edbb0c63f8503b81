//! `kubebuild version`

use clap::Args;

use kubebuild_driver::Driver;

use super::{cancel_on_ctrl_c, connect, BuilderArgs};
use crate::Result;

/// Print the buildkitd version of a running builder
#[derive(Args, Debug)]
pub struct VersionArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,
}

pub async fn run(args: VersionArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, _) = connect(&args.builder, None, false).await?;
    println!("kubebuild {}", env!("CARGO_PKG_VERSION"));
    println!("{}", driver.version(&ctx).await?);
    Ok(())
}
