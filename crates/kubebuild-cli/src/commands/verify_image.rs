//! `kubebuild verify-image` - start a throwaway pod to check an image.
//!
//! The image is never pulled; it must already be present on the node. A
//! missing image fails as soon as the kubelet reports it.

use clap::Args;

use super::{cancel_on_ctrl_c, connect, BuilderArgs};
use crate::Result;

/// Check that an image can be started on the cluster
#[derive(Args, Debug)]
pub struct VerifyImageArgs {
    /// Image reference to verify
    #[arg(value_name = "IMAGE")]
    pub reference: String,

    #[command(flatten)]
    pub builder: BuilderArgs,
}

pub async fn run(args: VerifyImageArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, _) = connect(&args.builder, None, false).await?;
    driver.verify_image(&ctx, &args.reference).await?;
    println!("Image '{}' started successfully.", args.reference);
    Ok(())
}
