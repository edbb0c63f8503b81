//! `kubebuild bootstrap` - bring a builder up and connect to it.
//!
//! Concurrent bootstraps of the same builder are safe: races are retried with
//! jitter. On failure the builder pod logs are printed to help diagnose why.

use std::time::Duration;

use clap::Args;
use tracing::{error, info};

use kubebuild_common::retry::RandomJitter;
use kubebuild_driver::{boot, ProgressWriter};

use super::{cancel_on_ctrl_c, connect, diagnostics_token, progress_line, BuilderArgs};
use crate::config;
use crate::Result;

const LOG_DUMP_BUDGET: Duration = Duration::from_secs(30);

/// Create or start a builder and wait until it accepts connections
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub builder: BuilderArgs,

    /// Replicas for a newly created builder
    #[arg(long)]
    pub replicas: Option<i32>,

    /// Scale to one replica per ready node once running
    #[arg(long, default_value = "false")]
    pub scale_to_nodes: bool,

    /// Make this builder the default for later commands
    #[arg(long = "use", default_value = "false")]
    pub use_builder: bool,
}

pub async fn run(args: BootstrapArgs) -> Result<()> {
    let ctx = cancel_on_ctrl_c();
    let (driver, settings) = connect(&args.builder, args.replicas, args.scale_to_nodes).await?;

    let (progress, mut rx) = ProgressWriter::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", progress_line(&event));
        }
    });

    let mut jitter = RandomJitter::from_entropy();
    let result = boot(&ctx, &driver, &progress, &mut jitter).await;
    drop(progress);
    let _ = printer.await;

    match result {
        Ok((_conn, endpoint)) => {
            info!(builder = %settings.name, endpoint = %endpoint, "builder is ready");
            println!("Builder '{}' is running ({}).", settings.name, endpoint);
        }
        Err(e) => {
            error!(builder = %settings.name, error = %e, "failed to bootstrap builder");
            let dump_ctx = diagnostics_token(LOG_DUMP_BUDGET);
            driver.dump_logs(&dump_ctx, &mut std::io::stdout()).await;
            return Err(e.into());
        }
    }

    if args.use_builder {
        let mut file = config::load_config()?;
        file.builder = Some(settings.name.clone());
        file.namespace = Some(driver.config().namespace.clone());
        config::save_config(&file)?;
        println!("Using builder '{}' by default.", settings.name);
    }
    Ok(())
}
