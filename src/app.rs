use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::debug;

use crate::cache::scan_sessions_dir;
use crate::config::{self, ArchiveConfig};
use crate::error::ScanError;
use crate::server::{self, ServeConfig};
use crate::service::{ArchiveService, DetailOutcome, ServiceSettings};
use crate::session::SessionMeta;
use crate::timeline::TimelineItem;
use crate::util::{format_age, format_cost, format_tokens, single_line, truncate};

const LIST_ID_WIDTH: usize = 14;
const LIST_MODEL_WIDTH: usize = 22;
const LIST_PROMPT_WIDTH: usize = 60;
const SHOW_ARGUMENTS_WIDTH: usize = 160;

pub fn build_service(config: &ArchiveConfig, sessions_dir: PathBuf) -> ArchiveService {
    ArchiveService::new(ServiceSettings::from_config(config, sessions_dir))
}

pub fn serve(
    config: &ArchiveConfig,
    sessions_dir: PathBuf,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let serve_config = ServeConfig {
        bind: bind.unwrap_or_else(|| config.server.bind.clone()),
        port: port.unwrap_or_else(|| config.effective_port()),
    };
    let service = Arc::new(build_service(config, sessions_dir));
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(server::serve(service, serve_config))
}

pub fn print_list(service: &ArchiveService, limit: Option<usize>) -> Result<()> {
    let sessions = service.list_sessions(limit);

    if sessions.is_empty() {
        println!("No sessions found in {}", service.sessions_dir().display());
        return Ok(());
    }

    println!(
        "{:<10} {:<id$} {:<model$} {:>5} {:>5} {:>8} {:>9}  PROMPT",
        "MODIFIED",
        "ID",
        "MODEL",
        "MSGS",
        "TOOLS",
        "TOKENS",
        "COST",
        id = LIST_ID_WIDTH,
        model = LIST_MODEL_WIDTH,
    );
    for meta in &sessions {
        println!("{}", format_session_row(meta));
    }
    Ok(())
}

pub fn print_session(service: &ArchiveService, session_id: &str) -> Result<u8> {
    match service.get_detail(session_id) {
        DetailOutcome::Found(detail) => {
            let meta = &detail.session;
            println!("session: {}", meta.id);
            println!("file: {}", meta.file_id);
            println!("started: {}", format_local(meta.started_at));
            println!("model: {} ({})", meta.model, meta.provider);
            println!(
                "messages: {} (with tool calls: {})",
                meta.message_count, meta.tool_call_count
            );
            println!(
                "usage: {} tokens, {}",
                format_tokens(meta.total_tokens),
                format_cost(meta.total_cost)
            );
            println!("last activity: {}", format_age(meta.last_activity));
            for item in &detail.timeline {
                println!();
                print!("{}", format_timeline_item(item));
            }
            Ok(0)
        }
        DetailOutcome::NotFound => {
            println!("session not found: {session_id}");
            Ok(1)
        }
        DetailOutcome::Invalid => {
            println!("invalid session id: {session_id}");
            Ok(2)
        }
        DetailOutcome::Failed(message) => {
            anyhow::bail!("failed to read session {session_id}: {message}")
        }
    }
}

pub fn doctor(config: &ArchiveConfig, sessions_dir: PathBuf) -> Result<u8> {
    let mut issues = 0u8;

    println!("session-archive doctor");
    println!("config_path: {}", config::config_path().display());
    println!("sessions_dir: {}", sessions_dir.display());
    println!("file_extension: {}", config.file_extension);

    match scan_sessions_dir(&sessions_dir, &config.file_extension) {
        Ok(files) => {
            println!("[OK] Sessions directory readable ({} file(s)).", files.len());
            let service = build_service(config, sessions_dir);
            let parsed = service
                .list_sessions(Some(config.limits.max_page_size))
                .len();
            debug!(files = files.len(), parsed, "doctor scan complete");
            if files.is_empty() {
                println!("[INFO] No session files yet.");
            } else if parsed == 0 {
                issues += 1;
                println!("[WARN] None of the session files contain decodable events.");
            } else {
                println!("[OK] {parsed} session(s) with decodable events.");
            }
        }
        Err(ScanError::Missing(path)) => {
            issues += 1;
            println!("[WARN] Sessions directory does not exist: {}", path.display());
        }
        Err(err) => {
            issues += 1;
            println!("[WARN] {err}");
        }
    }

    if config.synthetic_models.is_empty() {
        println!("[INFO] No synthetic model names configured.");
    } else {
        println!(
            "[OK] Synthetic model names: {}",
            config.synthetic_models.join(", ")
        );
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn format_session_row(meta: &SessionMeta) -> String {
    let age = format_age(meta.file_modified);
    format!(
        "{:<10} {:<id$} {:<model$} {:>5} {:>5} {:>8} {:>9}  {}",
        truncate(&age, 10),
        truncate(&meta.file_id, LIST_ID_WIDTH),
        truncate(&meta.model, LIST_MODEL_WIDTH),
        meta.message_count,
        meta.tool_call_count,
        format_tokens(meta.total_tokens),
        format_cost(meta.total_cost),
        truncate(&single_line(&meta.prompt), LIST_PROMPT_WIDTH),
        id = LIST_ID_WIDTH,
        model = LIST_MODEL_WIDTH,
    )
}

fn format_timeline_item(item: &TimelineItem) -> String {
    let mut out = format!("[{}] {}", format_local(item.timestamp), item.role.as_str());
    if let Some(model) = &item.model {
        out.push_str(&format!(" ({model})"));
    }
    out.push('\n');
    if let Some(thinking) = &item.thinking {
        for line in thinking.lines() {
            out.push_str(&format!("  ~ {line}\n"));
        }
    }
    for line in item.text.lines() {
        out.push_str(&format!("  {line}\n"));
    }
    for call in &item.tool_calls {
        out.push_str(&format!(
            "  -> {}({})\n",
            call.name,
            truncate(&single_line(&call.arguments), SHOW_ARGUMENTS_WIDTH)
        ));
    }
    out
}

fn format_local(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|ts| {
        ts.with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_else(|| "n/a".to_string())
}
