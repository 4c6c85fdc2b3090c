use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vidgate")]
#[command(author, version, about = "Video ingestion and access-controlled streaming server")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and background processor
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Sign a session credential for a user
    IssueToken {
        /// User id (a new random id if omitted)
        #[arg(long)]
        user: Option<String>,

        /// Role: viewer, editor, moderator, or admin
        #[arg(long, default_value = "editor")]
        role: String,

        /// Organization label for group visibility
        #[arg(long)]
        org: Option<String>,

        /// Lifetime in hours (defaults to auth.session_ttl_hours)
        #[arg(long)]
        ttl_hours: Option<u64>,
    },

    /// Probe a media file and display information
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        #[arg(value_name = "CONFIG")]
        file: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
