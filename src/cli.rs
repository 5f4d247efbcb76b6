//! CLI command handling.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "clawmux")]
#[command(about = "Multiplexes chat channels onto persistent Claude Code sessions")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon (default if no subcommand given)
    Run,

    /// Send one message to a channel's agent and print the reply
    Send {
        /// Channel key to address
        #[arg(long, default_value = "http")]
        channel: String,
        /// Message text
        message: String,
    },

    /// Internal: session host entry, spawned detached by the daemon
    #[command(hide = true)]
    SessionHost {
        /// Host configuration as one JSON document
        config: String,
    },
}
