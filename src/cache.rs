//! Incremental summary cache over the sessions directory.
//!
//! Every refresh lists the directory (cheap) and re-reads only files whose
//! `(mtime, size)` signature moved (expensive). File IO happens outside the
//! lock; the lock only covers planning and applying the results, so two
//! overlapping refreshes never see a torn entry map or snapshot.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ReadError, ScanError};
use crate::session::{
    ReduceOptions, SessionFile, SessionMeta, Signature, read_session_events, reduce_session,
};

#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub sessions: Arc<Vec<SessionMeta>>,
    pub tag: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    meta: SessionMeta,
    signature: Signature,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // Files that currently decode to zero events; remembered only to avoid re-reading them.
    unparseable: HashMap<String, Signature>,
    version: u64,
    // Refreshes are numbered before they scan; one older than the last applied is dropped.
    next_generation: u64,
    applied_generation: u64,
    snapshot_version: Option<u64>,
    snapshot: Arc<Vec<SessionMeta>>,
    tag: String,
}

impl CacheState {
    fn new(version: u64) -> Self {
        Self {
            entries: HashMap::new(),
            unparseable: HashMap::new(),
            version,
            next_generation: 0,
            applied_generation: 0,
            snapshot_version: None,
            snapshot: Arc::new(Vec::new()),
            tag: String::new(),
        }
    }

    fn snapshot(&mut self) -> CacheSnapshot {
        if self.snapshot_version != Some(self.version) {
            let mut sessions: Vec<SessionMeta> =
                self.entries.values().map(|entry| entry.meta.clone()).collect();
            sessions.sort_by(|left, right| {
                Reverse(left.file_modified)
                    .cmp(&Reverse(right.file_modified))
                    .then_with(|| left.file_id.cmp(&right.file_id))
            });
            self.snapshot = Arc::new(sessions);
            self.tag = cache_tag(self.version, self.entries.len());
            self.snapshot_version = Some(self.version);
            debug!(version = self.version, entries = self.entries.len(), "rebuilt session snapshot");
        }
        CacheSnapshot {
            sessions: Arc::clone(&self.snapshot),
            tag: self.tag.clone(),
        }
    }
}

#[derive(Debug)]
enum ParseOutcome {
    Parsed {
        name: String,
        signature: Signature,
        meta: SessionMeta,
    },
    Empty {
        name: String,
        signature: Signature,
    },
    Failed {
        name: String,
        error: ReadError,
    },
}

pub struct ArchiveCache {
    sessions_dir: PathBuf,
    extension: String,
    options: ReduceOptions,
    state: Mutex<CacheState>,
}

impl ArchiveCache {
    pub fn new(sessions_dir: PathBuf, extension: impl Into<String>, options: ReduceOptions) -> Self {
        // Seeding from the clock keeps tags from a previous process from matching.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self {
            sessions_dir,
            extension: extension.into(),
            options,
            state: Mutex::new(CacheState::new(seed)),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Reconciles the cache with the directory and returns the current snapshot.
    pub fn refresh(&self) -> CacheSnapshot {
        let generation = self.begin_refresh();
        let listing = match scan_sessions_dir(&self.sessions_dir, &self.extension) {
            Ok(files) => files,
            Err(ScanError::Missing(path)) => {
                debug!(path = %path.display(), "sessions directory missing; treating as empty");
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "sessions directory unreadable; treating as empty");
                Vec::new()
            }
        };

        let stale = self.plan(&listing);
        let outcomes: Vec<ParseOutcome> = stale.into_iter().map(|file| self.load(file)).collect();
        self.apply(generation, &listing, outcomes)
    }

    fn begin_refresh(&self) -> u64 {
        let mut state = self.lock_state();
        state.next_generation += 1;
        state.next_generation
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan(&self, listing: &[SessionFile]) -> Vec<SessionFile> {
        let state = self.lock_state();
        listing
            .iter()
            .filter(|file| {
                let signature = file.signature();
                let cached = state.entries.get(&file.name).map(|entry| entry.signature);
                let known_empty = state.unparseable.get(&file.name).copied();
                cached != Some(signature) && known_empty != Some(signature)
            })
            .cloned()
            .collect()
    }

    fn load(&self, file: SessionFile) -> ParseOutcome {
        let signature = file.signature();
        match read_session_events(&file.path) {
            Ok(parsed) if parsed.events.is_empty() => ParseOutcome::Empty {
                name: file.name,
                signature,
            },
            Ok(parsed) => {
                if parsed.skipped > 0 {
                    debug!(file = %file.name, skipped = parsed.skipped, "ignored undecodable lines");
                }
                let meta = reduce_session(&parsed.events, &self.options).with_file(&file);
                ParseOutcome::Parsed {
                    name: file.name,
                    signature,
                    meta,
                }
            }
            Err(error) => ParseOutcome::Failed {
                name: file.name,
                error,
            },
        }
    }

    fn apply(
        &self,
        generation: u64,
        listing: &[SessionFile],
        outcomes: Vec<ParseOutcome>,
    ) -> CacheSnapshot {
        let mut state = self.lock_state();
        if generation < state.applied_generation {
            debug!(
                generation,
                applied = state.applied_generation,
                "dropping results of a superseded refresh"
            );
            return state.snapshot();
        }
        state.applied_generation = generation;
        let mut transitions = 0u64;

        for outcome in outcomes {
            match outcome {
                ParseOutcome::Parsed {
                    name,
                    signature,
                    meta,
                } => {
                    state.unparseable.remove(&name);
                    let unchanged = state
                        .entries
                        .get(&name)
                        .is_some_and(|entry| entry.signature == signature);
                    if unchanged {
                        continue;
                    }
                    let replaced = state
                        .entries
                        .insert(name.clone(), CacheEntry { meta, signature })
                        .is_some();
                    debug!(file = %name, replaced, "cached session summary");
                    transitions += 1;
                }
                ParseOutcome::Empty { name, signature } => {
                    if state.entries.remove(&name).is_some() {
                        debug!(file = %name, "session no longer has decodable events");
                        transitions += 1;
                    }
                    state.unparseable.insert(name, signature);
                }
                ParseOutcome::Failed { name, error } => {
                    warn!(file = %name, error = %error, "failed to read session file");
                }
            }
        }

        let listed: HashSet<&str> = listing.iter().map(|file| file.name.as_str()).collect();
        let before = state.entries.len();
        state.entries.retain(|name, _| listed.contains(name.as_str()));
        state.unparseable.retain(|name, _| listed.contains(name.as_str()));
        let evicted = before - state.entries.len();
        if evicted > 0 {
            info!(evicted, "evicted sessions no longer on disk");
            transitions += evicted as u64;
        }

        state.version += transitions;
        state.snapshot()
    }
}

pub fn cache_tag(version: u64, entries: usize) -> String {
    format!("\"{version}-{entries}\"")
}

/// Flat listing of session files with the given extension; dot-files are ignored.
pub fn scan_sessions_dir(dir: &Path, extension: &str) -> Result<Vec<SessionFile>, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::Missing(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(ScanError::Unreadable {
                    path: dir.to_path_buf(),
                    source: err,
                });
            }
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if let Some(file) = SessionFile::from_metadata(path, &metadata) {
            files.push(file);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, OpenOptions};
    use std::io::Write as _;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options() -> ReduceOptions {
        ReduceOptions {
            prompt_chars: 100,
            synthetic_models: vec!["delivery-mirror".to_string()],
        }
    }

    fn write_session(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).expect("write session");
        path
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let file = File::options().write(true).open(path).expect("open for mtime");
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .expect("set mtime");
    }

    const SIMPLE: &str = r#"{"type":"session","id":"s","timestamp":"2026-02-09T16:33:13Z"}
{"type":"message","message":{"role":"user","content":"hello"}}
"#;

    #[test]
    fn unchanged_directory_keeps_the_same_tag() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(tmp.path(), "a.jsonl", SIMPLE);
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());

        let first = cache.refresh();
        let second = cache.refresh();
        assert_eq!(first.tag, second.tag);
        assert!(Arc::ptr_eq(&first.sessions, &second.sessions));
        assert_eq!(first.sessions.len(), 1);
    }

    #[test]
    fn files_without_events_are_excluded_until_they_have_one() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(tmp.path(), "good.jsonl", SIMPLE);
        let empty = write_session(tmp.path(), "empty.jsonl", "");
        write_session(tmp.path(), "garbage.jsonl", "not json\n{also not\n");
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());

        let snapshot = cache.refresh();
        let ids: Vec<&str> = snapshot.sessions.iter().map(|meta| meta.file_id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);

        fs::write(&empty, SIMPLE).expect("fill empty");
        let snapshot = cache.refresh();
        assert_eq!(snapshot.sessions.len(), 2);
    }

    #[test]
    fn changed_signature_is_reparsed() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(tmp.path(), "a.jsonl", SIMPLE);
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());

        let first = cache.refresh();
        assert_eq!(first.sessions[0].message_count, 1);

        let mut file = OpenOptions::new().append(true).open(&path).expect("open append");
        writeln!(
            file,
            r#"{{"type":"message","message":{{"role":"assistant","content":"hi","usage":{{"totalTokens":7,"cost":0.5}}}}}}"#
        )
        .expect("append");
        drop(file);

        let second = cache.refresh();
        assert_ne!(first.tag, second.tag);
        assert_eq!(second.sessions[0].message_count, 2);
        assert_eq!(second.sessions[0].total_tokens, 7);
    }

    #[test]
    fn removed_files_are_evicted() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(tmp.path(), "a.jsonl", SIMPLE);
        let doomed = write_session(tmp.path(), "b.jsonl", SIMPLE);
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());

        let first = cache.refresh();
        assert_eq!(first.sessions.len(), 2);

        fs::remove_file(doomed).expect("remove");
        let second = cache.refresh();
        assert_eq!(second.sessions.len(), 1);
        assert_eq!(second.sessions[0].file_id, "a");
        assert_ne!(first.tag, second.tag);
    }

    #[test]
    fn snapshot_is_sorted_by_most_recent_modification() {
        let tmp = TempDir::new().expect("temp dir");
        let old = write_session(tmp.path(), "old.jsonl", SIMPLE);
        let new = write_session(tmp.path(), "new.jsonl", SIMPLE);
        let middle = write_session(tmp.path(), "middle.jsonl", SIMPLE);
        set_mtime(&old, 1_700_000_000);
        set_mtime(&middle, 1_700_000_500);
        set_mtime(&new, 1_700_001_000);
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());

        let snapshot = cache.refresh();
        let ids: Vec<&str> = snapshot.sessions.iter().map(|meta| meta.file_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "middle", "old"]);
    }

    #[test]
    fn missing_directory_yields_empty_snapshot() {
        let tmp = TempDir::new().expect("temp dir");
        let cache = ArchiveCache::new(tmp.path().join("nope"), "jsonl", options());
        let first = cache.refresh();
        let second = cache.refresh();
        assert!(first.sessions.is_empty());
        assert_eq!(first.tag, second.tag);
    }

    #[test]
    fn scan_ignores_other_extensions_dotfiles_and_directories() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(tmp.path(), "a.jsonl", SIMPLE);
        write_session(tmp.path(), "b.json", SIMPLE);
        write_session(tmp.path(), ".hidden.jsonl", SIMPLE);
        write_session(tmp.path(), "a.jsonl.lock", "");
        fs::create_dir(tmp.path().join("nested.jsonl")).expect("mkdir");

        let files = scan_sessions_dir(tmp.path(), "jsonl").expect("scan");
        let names: Vec<&str> = files.iter().map(|file| file.name.as_str()).collect();
        assert_eq!(names, vec!["a.jsonl"]);
    }

    #[test]
    fn rewrite_with_older_mtime_still_replaces_the_entry() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(
            tmp.path(),
            "a.jsonl",
            r#"{"type":"message","message":{"role":"user","content":"old"}}"#,
        );
        set_mtime(&path, 1_700_001_000);
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());
        let first = cache.refresh();
        assert_eq!(first.sessions[0].prompt, "old");

        fs::write(
            &path,
            r#"{"type":"message","message":{"role":"user","content":"restored content"}}"#,
        )
        .expect("rewrite");
        set_mtime(&path, 1_700_000_000);

        let second = cache.refresh();
        assert_eq!(second.sessions[0].prompt, "restored content");
        assert_ne!(first.tag, second.tag);

        let third = cache.refresh();
        assert_eq!(third.tag, second.tag);
        assert!(Arc::ptr_eq(&second.sessions, &third.sessions));
    }

    #[test]
    fn superseded_refresh_does_not_undo_a_newer_one() {
        let tmp = TempDir::new().expect("temp dir");
        let cache = ArchiveCache::new(tmp.path().to_path_buf(), "jsonl", options());

        let older = cache.begin_refresh();
        let older_listing = scan_sessions_dir(tmp.path(), "jsonl").expect("scan");
        assert!(older_listing.is_empty());

        write_session(tmp.path(), "x.jsonl", SIMPLE);
        let newer = cache.refresh();
        assert_eq!(newer.sessions.len(), 1);

        let stale = cache.apply(older, &older_listing, Vec::new());
        assert_eq!(stale.tag, newer.tag);
        assert_eq!(stale.sessions.len(), 1);
        assert_eq!(cache.refresh().tag, newer.tag);
    }

    fn tag_count(tag: &str) -> usize {
        tag.trim_matches('"')
            .rsplit('-')
            .next()
            .and_then(|count| count.parse().ok())
            .expect("tag carries an entry count")
    }

    fn assert_consistent(snapshot: &CacheSnapshot) {
        assert_eq!(snapshot.sessions.len(), tag_count(&snapshot.tag));
        for pair in snapshot.sessions.windows(2) {
            let ordered = (Reverse(pair[0].file_modified), &pair[0].file_id)
                <= (Reverse(pair[1].file_modified), &pair[1].file_id);
            assert!(ordered, "{} before {}", pair[0].file_id, pair[1].file_id);
        }
    }

    #[test]
    fn concurrent_refreshes_stay_consistent_while_files_change() {
        let tmp = TempDir::new().expect("temp dir");
        let dir = tmp.path().to_path_buf();
        let grower = write_session(&dir, "grower.jsonl", SIMPLE);
        let cache = Arc::new(ArchiveCache::new(dir.clone(), "jsonl", options()));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for _ in 0..50 {
                        assert_consistent(&cache.refresh());
                    }
                });
            }
            scope.spawn(|| {
                for round in 0..40 {
                    write_session(&dir, &format!("w{round}.jsonl"), SIMPLE);
                    let mut file = OpenOptions::new()
                        .append(true)
                        .open(&grower)
                        .expect("open append");
                    writeln!(
                        file,
                        r#"{{"type":"message","message":{{"role":"user","content":"round {round}"}}}}"#
                    )
                    .expect("append");
                    if round >= 2 {
                        fs::remove_file(dir.join(format!("w{}.jsonl", round - 2)))
                            .expect("remove");
                    }
                }
            });
        });

        let settled = cache.refresh();
        assert_consistent(&settled);
        let mut ids: Vec<&str> = settled.sessions.iter().map(|meta| meta.file_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["grower", "w38", "w39"]);
        let grower_meta = settled
            .sessions
            .iter()
            .find(|meta| meta.file_id == "grower")
            .expect("grower listed");
        assert_eq!(grower_meta.message_count, 41);
        assert_eq!(cache.refresh().tag, settled.tag);
    }

    #[test]
    fn cache_tag_is_quoted_version_and_count() {
        assert_eq!(cache_tag(7, 3), "\"7-3\"");
    }
}
