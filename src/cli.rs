use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "capture")]
#[command(about = "Scheduled sales capture for raffle campaigns", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler and the HTTP control API (default)
    Daemon,
    /// Run one capture now and exit
    Capture {
        /// Capture the listing only, skipping per-entry reports
        #[arg(long)]
        no_details: bool,
    },
    /// Archive or delete capture files past the retention window
    Cleanup,
    /// Write a backup bundle now, regardless of the backup days
    Backup,
}
