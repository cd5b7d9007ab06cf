use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Link: multi-person email approvals for Morpheus
#[derive(Parser)]
#[command(name = "link", version, about)]
pub struct Cli {
    /// Connection settings file
    #[arg(long, global = true, env = "LINK_CONFIG", default_value = "config.env")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the poller and the HTTPS action endpoint
    Serve {
        /// Port to bind (overrides LINK_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check config.env and approvals.yaml, then exit
    Validate,

    /// Inspect tracked approvals
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Inspect the feed cursor
    Cursor {
        #[command(subcommand)]
        command: CursorCommands,
    },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List open approvals
    List {
        /// Include archived (applied, expired, info requested) approvals
        #[arg(long)]
        all: bool,
    },
    /// Show one tracked approval as JSON
    Show { approval_id: i64 },
    /// Re-send a decision whose apply retries were exhausted
    Retry { approval_id: i64 },
}

#[derive(Subcommand)]
pub enum CursorCommands {
    /// Print the highest approval id already polled
    Show,
}
