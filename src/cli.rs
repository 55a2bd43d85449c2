use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "icron")]
#[command(about = "Personal AI agent with workspace tools, memory and reminders", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Config file (default: ~/.icron/config.json)
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Debug-level diagnostics on stderr
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Write a default config and create the workspace skeleton.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Interactive chat on stdin/stdout.
    Chat {
        /// Session key (channel:chat_id)
        #[arg(short, long, default_value = "cli:direct")]
        session: String,
    },

    /// Send one message and print the reply.
    Ask {
        #[arg(short, long)]
        message: String,
        /// Session key (channel:chat_id)
        #[arg(short, long, default_value = "cli:direct")]
        session: String,
    },

    /// Rebuild the memory index from MEMORY.md and memory/*.md.
    Index,

    /// Hybrid search over indexed memory.
    Search {
        query: String,
        /// Number of results
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Vector weight in [0, 1]; 0 is keyword-only, 1 is vector-only
        #[arg(long)]
        weight: Option<f32>,
    },

    /// List stored conversation sessions.
    Sessions,

    /// Have two configured providers discuss a task until they agree.
    Collab { task: String },

    /// Show config, workspace, provider and scheduler state.
    Status,
}
