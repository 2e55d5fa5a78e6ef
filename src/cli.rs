use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Supervision and orphan reclamation for tmux-hosted agent fleets",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Find orphaned sessions and agent processes, optionally cleaning them up
    Doctor {
        /// Town root (defaults to the current directory)
        #[arg(long)]
        town: Option<PathBuf>,

        /// Kill what the checks found, after re-verifying each target
        #[arg(long)]
        fix: bool,

        /// With --fix, report what would be killed without killing anything
        #[arg(long, requires = "fix")]
        dry_run: bool,
    },

    /// List tmux sessions with their pane commands
    Sessions,

    /// Make sure a session exists with a live agent, replacing zombies
    Ensure {
        /// Session name
        name: String,

        /// Working directory for a newly created session
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Exit 0 if an agent is running in the session's pane, 1 otherwise
    AgentRunning {
        /// Session name
        name: String,

        /// Process names that count as an agent (defaults to config)
        names: Vec<String>,
    },

    /// Kill a session and every process under its pane
    KillSession {
        /// Session name
        name: String,
    },

    /// Stop background daemons matching the configured patterns
    StopDaemons {
        /// Skip SIGTERM and send SIGKILL immediately
        #[arg(long)]
        force: bool,

        /// Report matching processes without signalling them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show configuration
    Config {
        /// Emit JSON instead of grouped text
        #[arg(long)]
        json: bool,
    },
}
