//! kubebuild CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// kubebuild - buildkit builders on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kubebuild")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or start a builder and wait until it accepts connections
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Show the status and endpoints of a builder
    Status(commands::status::StatusArgs),
    /// List builders and their endpoints
    Ls(commands::status::StatusArgs),
    /// Scale a builder down to zero replicas
    Stop(commands::remove::StopArgs),
    /// Delete a builder
    Rm(commands::remove::RmArgs),
    /// Scale a builder to one replica per ready node
    Scale(commands::scale::ScaleArgs),
    /// Print the logs of every builder pod
    Logs(commands::logs::LogsArgs),
    /// Check that an image can be started on the cluster
    VerifyImage(commands::verify_image::VerifyImageArgs),
    /// Print the buildkitd version of a running builder
    Version(commands::version::VersionArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::Status(args) => commands::status::run(args).await,
            Commands::Ls(args) => commands::status::run_ls(args).await,
            Commands::Stop(args) => commands::remove::run_stop(args).await,
            Commands::Rm(args) => commands::remove::run_rm(args).await,
            Commands::Scale(args) => commands::scale::run(args).await,
            Commands::Logs(args) => commands::logs::run(args).await,
            Commands::VerifyImage(args) => commands::verify_image::run(args).await,
            Commands::Version(args) => commands::version::run(args).await,
        }
    }
}
