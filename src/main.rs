use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use session_archive::app;
use session_archive::cli::{Cli, Commands};
use session_archive::config::ArchiveConfig;
use session_archive::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("session-archive error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = ArchiveConfig::load_or_init()?;
    let sessions_dir = cli.sessions_dir.unwrap_or_else(|| config.sessions_dir());

    match cli.command {
        Some(Commands::List { limit }) => {
            let service = app::build_service(&config, sessions_dir);
            app::print_list(&service, limit)?;
            Ok(0)
        }
        Some(Commands::Show { session_id }) => {
            let service = app::build_service(&config, sessions_dir);
            app::print_session(&service, &session_id)
        }
        Some(Commands::Doctor) => app::doctor(&config, sessions_dir),
        Some(Commands::Serve { bind, port }) => {
            app::serve(&config, sessions_dir, bind, port)?;
            Ok(0)
        }
        None => {
            app::serve(&config, sessions_dir, None, None)?;
            Ok(0)
        }
    }
}
