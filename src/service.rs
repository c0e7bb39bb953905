use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::ArchiveCache;
use crate::config::ArchiveConfig;
use crate::error::ReadError;
use crate::session::{
    ReduceOptions, SessionFile, SessionMeta, read_session_events, reduce_session,
};
use crate::timeline::{TimelineItem, build_timeline};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub sessions_dir: PathBuf,
    pub file_extension: String,
    pub synthetic_models: Vec<String>,
    pub list_prompt_chars: usize,
    pub detail_prompt_chars: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl ServiceSettings {
    pub fn from_config(config: &ArchiveConfig, sessions_dir: PathBuf) -> Self {
        Self {
            sessions_dir,
            file_extension: config.file_extension.clone(),
            synthetic_models: config.synthetic_models.clone(),
            list_prompt_chars: config.limits.list_prompt_chars,
            detail_prompt_chars: config.limits.detail_prompt_chars,
            default_page_size: config.limits.default_page_size,
            max_page_size: config.limits.max_page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub session: SessionMeta,
    pub timeline: Vec<TimelineItem>,
}

#[derive(Debug, Clone)]
pub enum ListOutcome {
    NotModified { tag: String },
    Modified { sessions: Vec<SessionMeta>, tag: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetailOutcome {
    Found(SessionDetail),
    NotFound,
    Invalid,
    Failed(String),
}

/// Read-only view over one sessions directory. Lists go through the shared
/// cache; details always re-read the file.
pub struct ArchiveService {
    settings: ServiceSettings,
    cache: ArchiveCache,
    detail_options: ReduceOptions,
}

impl ArchiveService {
    pub fn new(settings: ServiceSettings) -> Self {
        let list_options = ReduceOptions {
            prompt_chars: settings.list_prompt_chars,
            synthetic_models: settings.synthetic_models.clone(),
        };
        let detail_options = ReduceOptions {
            prompt_chars: settings.detail_prompt_chars,
            synthetic_models: settings.synthetic_models.clone(),
        };
        let cache = ArchiveCache::new(
            settings.sessions_dir.clone(),
            settings.file_extension.clone(),
            list_options,
        );
        Self {
            settings,
            cache,
            detail_options,
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        self.cache.sessions_dir()
    }

    pub fn list_summaries(&self, limit: Option<usize>, if_none_match: Option<&str>) -> ListOutcome {
        let snapshot = self.cache.refresh();
        if let Some(header) = if_none_match
            && tag_matches(header, &snapshot.tag)
        {
            debug!(tag = %snapshot.tag, "session list not modified");
            return ListOutcome::NotModified { tag: snapshot.tag };
        }

        ListOutcome::Modified {
            sessions: self.page(&snapshot.sessions, limit),
            tag: snapshot.tag,
        }
    }

    /// Unconditional listing for callers that never hold a tag.
    pub fn list_sessions(&self, limit: Option<usize>) -> Vec<SessionMeta> {
        let snapshot = self.cache.refresh();
        self.page(&snapshot.sessions, limit)
    }

    fn page(&self, sessions: &[SessionMeta], limit: Option<usize>) -> Vec<SessionMeta> {
        sessions.iter().take(self.clamp_limit(limit)).cloned().collect()
    }

    pub fn get_detail(&self, session_id: &str) -> DetailOutcome {
        if !is_valid_session_id(session_id) {
            return DetailOutcome::Invalid;
        }

        let path = self
            .settings
            .sessions_dir
            .join(format!("{session_id}.{}", self.settings.file_extension));
        let file = match SessionFile::stat(&path) {
            Ok(file) => file,
            Err(ReadError::NotFound(_)) => return DetailOutcome::NotFound,
            Err(err) => {
                warn!(session = session_id, error = %err, "failed to stat session file");
                return DetailOutcome::Failed(err.to_string());
            }
        };

        let parsed = match read_session_events(&file.path) {
            Ok(parsed) => parsed,
            Err(ReadError::NotFound(_)) => return DetailOutcome::NotFound,
            Err(err) => {
                warn!(session = session_id, error = %err, "failed to read session file");
                return DetailOutcome::Failed(err.to_string());
            }
        };
        if parsed.events.is_empty() {
            return DetailOutcome::NotFound;
        }

        let session = reduce_session(&parsed.events, &self.detail_options).with_file(&file);
        let timeline = build_timeline(&parsed.events);
        DetailOutcome::Found(SessionDetail { session, timeline })
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        let max = self.settings.max_page_size.max(1);
        limit
            .unwrap_or(self.settings.default_page_size)
            .clamp(1, max)
    }
}

/// `If-None-Match` semantics: a comma list of tags, weak prefixes ignored, `*` matches anything.
pub fn tag_matches(header: &str, current: &str) -> bool {
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == current
    })
}

pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && !session_id.starts_with('.')
        && !session_id.contains("..")
        && !session_id.contains(['/', '\\', '\0'])
}
