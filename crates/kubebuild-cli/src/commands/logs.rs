//! `kubebuild logs` - print a snapshot of every builder pod's logs

use clap::Args;

use super::{cancel_on_ctrl_c, connect, BuilderArgs};
use crate::{Error, Result};

/// Print the logs of every builder pod
#[derive(Args, Debug)]
pub struct LogsArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,
}

pub async fn run(args: LogsArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, settings) = connect(&args.builder, None, false).await?;
    let dumped = driver.dump_logs(&ctx, &mut std::io::stdout()).await;
    if dumped == 0 {
        return Err(Error::command_failed(format!(
            "no logs found for builder '{}'",
            settings.name
        )));
    }
    Ok(())
}
