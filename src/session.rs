use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{DecodeError, ReadError};
use crate::event::{ContentBlock, Event, MessageContent, MessageEvent, Role, decode_line};
use crate::util::clip_chars;

pub const UNKNOWN: &str = "unknown";

/// One archive entry as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    /// File stem; the identifier callers use to request a detail view.
    pub id: String,
    /// Full file name; the cache key.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Cheap change detector: a file is re-read only when this pair moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub mtime_nanos: u128,
    pub size: u64,
}

impl SessionFile {
    pub fn from_metadata(path: &Path, metadata: &std::fs::Metadata) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        let id = path.file_stem()?.to_str()?.to_string();
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id,
            name,
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok()?,
        })
    }

    pub fn stat(path: &Path) -> Result<Self, ReadError> {
        let metadata = std::fs::metadata(path).map_err(|err| ReadError::from_io(path, err))?;
        if !metadata.is_file() {
            return Err(ReadError::NotFound(path.to_path_buf()));
        }
        Self::from_metadata(path, &metadata).ok_or_else(|| {
            ReadError::from_io(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "unusable file name or mtime"),
            )
        })
    }

    pub fn signature(&self) -> Signature {
        Signature {
            mtime_nanos: self
                .modified
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or(0),
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub file_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub model: String,
    pub provider: String,
    pub message_count: usize,
    /// Messages containing at least one tool invocation, not invocations.
    pub tool_call_count: usize,
    pub prompt: String,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub file_size: u64,
    pub file_modified: Option<DateTime<Utc>>,
}

impl SessionMeta {
    pub fn with_file(mut self, file: &SessionFile) -> Self {
        self.file_id = file.id.clone();
        self.file_size = file.size;
        self.file_modified = Some(DateTime::<Utc>::from(file.modified));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReduceOptions {
    pub prompt_chars: usize,
    /// Model names used by relayed/mirrored messages; never a real model choice.
    pub synthetic_models: Vec<String>,
}

impl ReduceOptions {
    fn is_synthetic(&self, model: &str) -> bool {
        self.synthetic_models
            .iter()
            .any(|synthetic| synthetic.eq_ignore_ascii_case(model))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionEvents {
    pub events: Vec<Event>,
    pub skipped: usize,
}

pub fn read_session_events(path: &Path) -> Result<SessionEvents, ReadError> {
    let file = File::open(path).map_err(|err| ReadError::from_io(path, err))?;
    let mut reader = BufReader::new(file);
    parse_lines(&mut reader).map_err(|err| ReadError::from_io(path, err))
}

fn parse_lines<R: BufRead>(reader: &mut R) -> io::Result<SessionEvents> {
    let mut parsed = SessionEvents::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf)?;
        if bytes == 0 {
            break;
        }
        line_no += 1;
        let Ok(line) = std::str::from_utf8(&buf) else {
            parsed.skipped += 1;
            trace!(line_no, "skipping line with invalid UTF-8");
            continue;
        };
        match decode_line(line) {
            Ok(event) => parsed.events.push(event),
            Err(DecodeError::Blank) => {}
            Err(err) => {
                parsed.skipped += 1;
                trace!(line_no, error = %err, "skipping undecodable line");
            }
        }
    }
    Ok(parsed)
}

pub fn reduce_session(events: &[Event], options: &ReduceOptions) -> SessionMeta {
    let mut accumulator = SessionAccumulator::default();
    for event in events {
        accumulator.apply_event(event, options);
    }
    accumulator.build_meta(options)
}

#[derive(Debug, Clone)]
struct ModelChoice {
    model: String,
    provider: Option<String>,
}

#[derive(Debug, Default)]
struct SessionAccumulator {
    seen_start: bool,
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    latest_model_change: Option<ModelChoice>,
    first_message_model: Option<ModelChoice>,
    message_count: usize,
    tool_call_count: usize,
    prompt: Option<String>,
    total_cost: f64,
    total_tokens: u64,
    last_activity: Option<DateTime<Utc>>,
}

impl SessionAccumulator {
    fn apply_event(&mut self, event: &Event, options: &ReduceOptions) {
        match event {
            Event::SessionStart { id, timestamp } => {
                if !self.seen_start {
                    self.seen_start = true;
                    self.session_id = id.clone();
                    self.started_at = *timestamp;
                }
            }
            Event::ModelChange { model, provider } => {
                if let Some(model) = model.as_deref().map(str::trim)
                    && !model.is_empty()
                {
                    self.latest_model_change = Some(ModelChoice {
                        model: model.to_string(),
                        provider: provider.clone(),
                    });
                }
            }
            Event::Message(message) => self.apply_message(message, options),
            Event::Other { .. } => {}
        }
    }

    fn apply_message(&mut self, message: &MessageEvent, options: &ReduceOptions) {
        self.message_count += 1;
        if message.has_tool_call() {
            self.tool_call_count += 1;
        }
        if let Some(usage) = message.usage {
            self.total_cost += usage.cost;
            self.total_tokens = self.total_tokens.saturating_add(usage.total_tokens);
        }
        self.last_activity = message.timestamp.or(self.last_activity);

        if self.prompt.is_none() && message.role == Role::User {
            self.prompt = Some(prompt_text(&message.content));
        }

        if self.first_message_model.is_none()
            && message.role == Role::Assistant
            && let Some(model) = message.model.as_deref()
            && !options.is_synthetic(model)
        {
            self.first_message_model = Some(ModelChoice {
                model: model.to_string(),
                provider: message.provider.clone(),
            });
        }
    }

    fn build_meta(self, options: &ReduceOptions) -> SessionMeta {
        let choice = self.latest_model_change.or(self.first_message_model);
        let (model, provider) = match choice {
            Some(choice) => (
                choice.model,
                choice
                    .provider
                    .filter(|provider| !provider.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN.to_string()),
            ),
            None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
        };

        SessionMeta {
            id: self
                .session_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            file_id: String::new(),
            started_at: self.started_at,
            model,
            provider,
            message_count: self.message_count,
            tool_call_count: self.tool_call_count,
            prompt: clip_chars(self.prompt.as_deref().unwrap_or_default(), options.prompt_chars),
            total_cost: self.total_cost,
            total_tokens: self.total_tokens,
            last_activity: self.last_activity,
            file_size: 0,
            file_modified: None,
        }
    }
}

fn prompt_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .find_map(|block| match block {
                ContentBlock::Text(text) => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default(),
    }
}
