//! Snapshot + diff log storage backends and the upstream HTTP fetcher.

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use scorewatch_core::{snapshot_from_records, snapshot_to_records, DiffLogEntry, Snapshot, SnapshotRecord};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scorewatch-storage";

pub const SNAPSHOT_FILE_NAME: &str = "agent_id.json";
pub const DIFF_LOG_FILE_NAME: &str = "diff_log.csv";
pub const DIFF_LOG_HEADER: &str = "timestamp,total_diff";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replace-snapshot + append-log persistence shared by the sync loop and the
/// web handlers.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn load_snapshot(&self) -> Result<Snapshot, StoreError>;

    async fn replace_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn append_log_entry(&self, entry: &DiffLogEntry) -> Result<(), StoreError>;

    async fn read_log(&self) -> Result<Vec<DiffLogEntry>, StoreError>;

    /// Persists the outcome of one completed cycle.
    async fn commit_cycle(&self, snapshot: &Snapshot, entry: &DiffLogEntry) -> Result<(), StoreError> {
        self.replace_snapshot(snapshot).await?;
        self.append_log_entry(entry).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown store backend `{0}` (expected `memory` or `file`)")]
pub struct UnknownStoreKind(pub String);

impl FromStr for StoreKind {
    type Err = UnknownStoreKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "file" | "files" => Ok(Self::File),
            other => Err(UnknownStoreKind(other.to_string())),
        }
    }
}

pub fn open_store(kind: StoreKind, data_dir: impl Into<PathBuf>) -> Arc<dyn ScoreStore> {
    match kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(FileStore::new(data_dir)),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshot: Snapshot,
    log: Vec<DiffLogEntry>,
}

/// Process-local store; everything is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.state.lock().await.snapshot.clone())
    }

    async fn replace_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.state.lock().await.snapshot = snapshot.clone();
        Ok(())
    }

    async fn append_log_entry(&self, entry: &DiffLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.log.push(entry.clone());
        Ok(())
    }

    async fn read_log(&self) -> Result<Vec<DiffLogEntry>, StoreError> {
        Ok(self.state.lock().await.log.clone())
    }

    async fn commit_cycle(&self, snapshot: &Snapshot, entry: &DiffLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.snapshot = snapshot.clone();
        state.log.push(entry.clone());
        Ok(())
    }
}

/// Flat-file store: `agent_id.json` snapshot plus `diff_log.csv` series.
///
/// The snapshot is replaced through a temp file and atomic rename. All access
/// from this process is serialized; other processes writing the same files
/// are not coordinated with.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    io_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            io_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE_NAME)
    }

    pub fn diff_log_path(&self) -> PathBuf {
        self.root.join(DIFF_LOG_FILE_NAME)
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StoreError::io("creating data directory", &self.root, err))
    }

    /// Writes the encoded snapshot next to its final path; the caller
    /// publishes it with [`Self::publish_snapshot`] or removes it.
    async fn stage_snapshot(&self, snapshot: &Snapshot) -> Result<PathBuf, StoreError> {
        let bytes = encode_snapshot(snapshot).map_err(|source| StoreError::Snapshot {
            path: self.snapshot_path(),
            source,
        })?;

        self.ensure_root().await?;
        let temp_path = self
            .root
            .join(format!(".{SNAPSHOT_FILE_NAME}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::io("opening temp snapshot", &temp_path, err))?;
        let written = match file.write_all(&bytes).await {
            Ok(()) => file.flush().await,
            Err(err) => Err(err),
        };
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("writing temp snapshot", &temp_path, err));
        }
        Ok(temp_path)
    }

    async fn publish_snapshot(&self, temp_path: &Path) -> Result<(), StoreError> {
        let path = self.snapshot_path();
        if let Err(err) = fs::rename(temp_path, &path).await {
            let _ = fs::remove_file(temp_path).await;
            return Err(StoreError::io("renaming temp snapshot into", &path, err));
        }
        Ok(())
    }

    /// Appends one row and returns the log length before the append. A failed
    /// write is cut back to that length.
    async fn append_row(&self, entry: &DiffLogEntry) -> Result<u64, StoreError> {
        self.ensure_root().await?;
        let path = self.diff_log_path();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| StoreError::io("opening", &path, err))?;
        let existing_len = file
            .metadata()
            .await
            .map_err(|err| StoreError::io("inspecting", &path, err))?
            .len();

        let mut chunk = String::new();
        if existing_len == 0 {
            chunk.push_str(DIFF_LOG_HEADER);
            chunk.push('\n');
        } else {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(existing_len - 1))
                .await
                .map_err(|err| StoreError::io("seeking in", &path, err))?;
            file.read_exact(&mut last)
                .await
                .map_err(|err| StoreError::io("reading", &path, err))?;
            if last[0] != b'\n' {
                chunk.push('\n');
            }
        }
        chunk.push_str(&format!("{},{}\n", entry.timestamp, entry.total_diff));

        let written = match file.write_all(chunk.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            let _ = file.set_len(existing_len).await;
            return Err(StoreError::io("appending to", &path, err));
        }
        Ok(existing_len)
    }

    async fn truncate_log(&self, len: u64) -> Result<(), StoreError> {
        let path = self.diff_log_path();
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|err| StoreError::io("opening", &path, err))?;
        file.set_len(len)
            .await
            .map_err(|err| StoreError::io("truncating", &path, err))
    }
}

#[async_trait]
impl ScoreStore for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.snapshot_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(err) => return Err(StoreError::io("reading", &path, err)),
        };
        if text.trim().is_empty() {
            return Ok(Snapshot::new());
        }
        let records: Vec<SnapshotRecord> =
            serde_json::from_str(&text).map_err(|source| StoreError::Snapshot { path, source })?;
        Ok(snapshot_from_records(records))
    }

    async fn replace_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let temp_path = self.stage_snapshot(snapshot).await?;
        self.publish_snapshot(&temp_path).await
    }

    async fn append_log_entry(&self, entry: &DiffLogEntry) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        self.append_row(entry).await.map(|_| ())
    }

    /// Stages the snapshot, appends the row, then publishes the snapshot.
    /// Either both files change or neither does.
    async fn commit_cycle(&self, snapshot: &Snapshot, entry: &DiffLogEntry) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let temp_path = self.stage_snapshot(snapshot).await?;

        let log_len = match self.append_row(entry).await {
            Ok(len) => len,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = self.publish_snapshot(&temp_path).await {
            if let Err(rollback) = self.truncate_log(log_len).await {
                warn!("diff log rollback failed after snapshot error: {rollback}");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn read_log(&self) -> Result<Vec<DiffLogEntry>, StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.diff_log_path();
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(parse_diff_log(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StoreError::io("reading", &path, err)),
        }
    }
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    snapshot_to_records(snapshot).serialize(&mut serializer)?;
    Ok(bytes)
}

fn parse_diff_log(text: &str) -> Vec<DiffLogEntry> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (idx == 0 && line == DIFF_LOG_HEADER) {
            continue;
        }
        let parsed = line
            .rsplit_once(',')
            .and_then(|(timestamp, diff)| Some((timestamp, diff.trim().parse::<i64>().ok()?)));
        match parsed {
            Some((timestamp, total_diff)) => entries.push(DiffLogEntry::new(timestamp, total_diff)),
            None => warn!(line = idx + 1, content = line, "skipping malformed diff log row"),
        }
    }
    entries
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("expected a json array of agents, got {0}")]
    NotAnArray(&'static str),
}

/// Single-shot client for the top-agents endpoint. No retries: a failure is
/// surfaced to the caller as-is.
#[derive(Debug, Clone)]
pub struct AgentFetcher {
    client: reqwest::Client,
    url: String,
    number_of_agents: u32,
}

impl AgentFetcher {
    pub fn new(
        config: HttpClientConfig,
        url: impl Into<String>,
        number_of_agents: u32,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
            number_of_agents,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch_top_agents(&self) -> Result<Vec<JsonValue>, FetchError> {
        let span = info_span!("http_fetch", url = %self.url, number_of_agents = self.number_of_agents);
        self.fetch_inner().instrument(span).await
    }

    async fn fetch_inner(&self) -> Result<Vec<JsonValue>, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("number_of_agents", self.number_of_agents)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        match serde_json::from_slice::<JsonValue>(&body)? {
            JsonValue::Array(items) => Ok(items),
            other => Err(FetchError::NotAnArray(json_kind(&other))),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

pub fn is_timeout(err: &FetchError) -> bool {
    matches!(err, FetchError::Request(inner) if inner.is_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_snapshot() -> Snapshot {
        [("agent-b".to_string(), 10), ("agent-a".to_string(), 50)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn memory_store_starts_empty_and_commits_together() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot().await.unwrap().is_empty());
        assert!(store.read_log().await.unwrap().is_empty());

        store
            .commit_cycle(&sample_snapshot(), &DiffLogEntry::new("2026-02-24 12:00:00", 40))
            .await
            .unwrap();
        store
            .commit_cycle(&Snapshot::new(), &DiffLogEntry::new("2026-02-24 12:10:00", 0))
            .await
            .unwrap();

        assert!(store.load_snapshot().await.unwrap().is_empty());
        let log = store.read_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].total_diff, 40);
        assert_eq!(log[1].timestamp, "2026-02-24 12:10:00");
    }

    #[tokio::test]
    async fn file_store_writes_indented_snapshot_and_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        assert!(store.load_snapshot().await.unwrap().is_empty());

        store.replace_snapshot(&sample_snapshot()).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join(SNAPSHOT_FILE_NAME)).unwrap();
        assert!(text.starts_with("[\n    {\n        \"agent_id\": \"agent-a\""));
        assert!(text.contains("\"score\": 50"));

        let reopened = FileStore::new(dir.path());
        assert_eq!(reopened.load_snapshot().await.unwrap(), sample_snapshot());

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_store_appends_csv_with_single_header() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("nested"));
        store
            .append_log_entry(&DiffLogEntry::new("2026-02-24 12:00:00", 40))
            .await
            .unwrap();
        store
            .append_log_entry(&DiffLogEntry::new("2026-02-24 12:10:00", -3))
            .await
            .unwrap();

        let text = std::fs::read_to_string(store.diff_log_path()).unwrap();
        assert_eq!(
            text,
            "timestamp,total_diff\n2026-02-24 12:00:00,40\n2026-02-24 12:10:00,-3\n"
        );

        let reopened = FileStore::new(store.root());
        let log = reopened.read_log().await.unwrap();
        assert_eq!(
            log,
            vec![
                DiffLogEntry::new("2026-02-24 12:00:00", 40),
                DiffLogEntry::new("2026-02-24 12:10:00", -3),
            ]
        );
    }

    #[tokio::test]
    async fn file_store_commit_keeps_snapshot_when_log_append_fails() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let old: Snapshot = [("old".to_string(), 1)].into_iter().collect();
        store.replace_snapshot(&old).await.unwrap();
        std::fs::create_dir(store.diff_log_path()).unwrap();

        let new: Snapshot = [("new".to_string(), 99)].into_iter().collect();
        let result = store
            .commit_cycle(&new, &DiffLogEntry::new("2026-02-24 12:10:00", 99))
            .await;
        assert!(result.is_err());
        assert_eq!(store.load_snapshot().await.unwrap(), old);

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_store_commit_rolls_back_log_when_snapshot_publish_fails() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        store
            .commit_cycle(&sample_snapshot(), &DiffLogEntry::new("2026-02-24 12:00:00", 60))
            .await
            .unwrap();
        let log_before = std::fs::read_to_string(store.diff_log_path()).unwrap();

        std::fs::remove_file(store.snapshot_path()).unwrap();
        std::fs::create_dir(store.snapshot_path()).unwrap();
        std::fs::write(store.snapshot_path().join("blocker"), "x").unwrap();

        let result = store
            .commit_cycle(&Snapshot::new(), &DiffLogEntry::new("2026-02-24 12:10:00", 0))
            .await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(store.diff_log_path()).unwrap(), log_before);
        assert_eq!(store.read_log().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_appends_after_log_missing_final_newline() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        std::fs::write(
            store.diff_log_path(),
            "timestamp,total_diff\n2026-02-24 12:00:00,4",
        )
        .unwrap();

        store
            .append_log_entry(&DiffLogEntry::new("2026-02-24 12:10:00", 2))
            .await
            .unwrap();
        assert_eq!(
            store.read_log().await.unwrap(),
            vec![
                DiffLogEntry::new("2026-02-24 12:00:00", 4),
                DiffLogEntry::new("2026-02-24 12:10:00", 2),
            ]
        );

        let header_only = FileStore::new(dir.path().join("fresh"));
        std::fs::create_dir_all(header_only.root()).unwrap();
        std::fs::write(header_only.diff_log_path(), DIFF_LOG_HEADER).unwrap();
        header_only
            .append_log_entry(&DiffLogEntry::new("2026-02-24 12:20:00", 1))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(header_only.diff_log_path()).unwrap(),
            "timestamp,total_diff\n2026-02-24 12:20:00,1\n"
        );
    }

    #[test]
    fn diff_log_parser_skips_bad_rows_and_accepts_crlf() {
        let text = "timestamp,total_diff\r\n2026-02-24 12:00:00,5\r\nbroken\r\n2026-02-24 12:10:00,x\r\n\r\n2026-02-24 12:20:00,7\r\n";
        let log = parse_diff_log(text);
        assert_eq!(
            log,
            vec![
                DiffLogEntry::new("2026-02-24 12:00:00", 5),
                DiffLogEntry::new("2026-02-24 12:20:00", 7),
            ]
        );
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_snapshot() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SNAPSHOT_FILE_NAME), "{not json").unwrap();
        let store = FileStore::new(dir.path());
        let err = store.load_snapshot().await.unwrap_err();
        assert!(matches!(err, StoreError::Snapshot { .. }));
    }

    #[test]
    fn store_kind_parses_config_values() {
        assert_eq!("memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!(" FILE ".parse::<StoreKind>().unwrap(), StoreKind::File);
        assert!("sqlite".parse::<StoreKind>().is_err());
        assert_eq!(open_store(StoreKind::File, ".").kind(), StoreKind::File);
    }

    #[tokio::test]
    async fn fetcher_sends_agent_count_and_returns_array() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/retrieval/top-agents")
                    .query_param("number_of_agents", "20");
                then.status(200).json_body(json!([
                    {"agent_id": "a", "final_score": 0.5},
                    "junk"
                ]));
            })
            .await;

        let fetcher = AgentFetcher::new(
            HttpClientConfig::default(),
            server.url("/retrieval/top-agents"),
            20,
        )
        .unwrap();
        let items = fetcher.fetch_top_agents().await.unwrap();
        assert_eq!(items.len(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetcher_fails_on_error_status_and_non_array_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/down");
                then.status(503).body("maintenance");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/object");
                then.status(200).json_body(json!({"agents": []}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/garbage");
                then.status(200).body("<html>");
            })
            .await;

        let down = AgentFetcher::new(HttpClientConfig::default(), server.url("/down"), 20).unwrap();
        match down.fetch_top_agents().await.unwrap_err() {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(status, 503);
                assert!(url.contains("number_of_agents=20"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let object = AgentFetcher::new(HttpClientConfig::default(), server.url("/object"), 20).unwrap();
        assert!(matches!(
            object.fetch_top_agents().await.unwrap_err(),
            FetchError::NotAnArray("an object")
        ));

        let garbage = AgentFetcher::new(HttpClientConfig::default(), server.url("/garbage"), 20).unwrap();
        assert!(matches!(
            garbage.fetch_top_agents().await.unwrap_err(),
            FetchError::Decode(_)
        ));
    }

    #[tokio::test]
    async fn fetcher_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200)
                    .delay(Duration::from_secs(2))
                    .json_body(json!([]));
            })
            .await;

        let fetcher = AgentFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_millis(200),
                user_agent: Some("scorewatch-test".into()),
            },
            server.url("/slow"),
            20,
        )
        .unwrap();
        let err = fetcher.fetch_top_agents().await.unwrap_err();
        assert!(is_timeout(&err), "expected timeout, got {err}");
    }
}
