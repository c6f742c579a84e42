use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Ask questions across your mail, calendar, issues, wiki and chat
#[derive(Parser)]
#[command(name = "huddle", about, version, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (.yml, .yaml or .toml). Defaults to ~/.huddle/config.yml
    #[arg(short, long, global = true, env = "HUDDLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one conversation turn and print the answer
    Ask {
        /// Conversation to continue; a fresh one is started when omitted
        #[arg(long)]
        conversation: Option<String>,
        /// Display name of the person asking
        #[arg(long)]
        name: Option<String>,
        /// Platform user id passed to tools
        #[arg(long)]
        user_id: Option<String>,
        /// IANA timezone, e.g. Europe/Berlin
        #[arg(long)]
        timezone: Option<String>,
        /// Print progress events as JSON instead of text
        #[arg(long)]
        json_progress: bool,
        /// The request
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Print the stored message log of a conversation
    History {
        #[arg(long)]
        conversation: String,
    },
    /// Delete expired conversations
    Purge,
    /// Check that configured model providers are reachable
    Check,
}
