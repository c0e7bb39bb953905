use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "session-archive",
    version,
    about = "Browse archived agent session logs from the terminal or over HTTP"
)]
pub struct Cli {
    /// Sessions directory to read instead of the configured one.
    #[arg(long, global = true, value_name = "DIR")]
    pub sessions_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the archive over HTTP (default).
    Serve {
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Print the most recently modified sessions.
    List {
        #[arg(long, short = 'n', value_name = "N")]
        limit: Option<usize>,
    },
    /// Print one session's timeline.
    Show {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
    /// Run health diagnostics for configuration and the sessions directory.
    Doctor,
}
