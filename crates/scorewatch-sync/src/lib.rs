//! Fetch/diff/persist cycle, its configuration and the aligned-mark scheduler.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use scorewatch_core::{diff_new_agents, parse_agent_scores, DiffLogEntry};
use scorewatch_storage::{is_timeout, open_store, AgentFetcher, FetchError, HttpClientConfig, ScoreStore, StoreKind};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scorewatch-sync";

pub const DEFAULT_API_URL: &str = "https://platform-v2.ridges.ai/retrieval/top-agents";
pub const THRESHOLD_ENV_VAR: &str = "THRESHOLD_SCORE";
pub const DEFAULT_INTERVAL_MINUTES: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// What happens when "now" sits exactly on a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundaryRule {
    /// The current mark counts as the next one; the delay is zero.
    #[default]
    AtMark,
    /// Skip to the following mark; the delay is a full interval.
    NextMark,
}

impl FromStr for BoundaryRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "at-mark" | "immediate" => Ok(Self::AtMark),
            "next-mark" | "skip" => Ok(Self::NextMark),
            other => Err(format!("unknown boundary rule `{other}` (expected `at-mark` or `next-mark`)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub number_of_agents: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub store_kind: StoreKind,
    pub data_dir: PathBuf,
    pub interval_minutes: u32,
    pub boundary_rule: BoundaryRule,
    pub run_on_start: bool,
    pub web_port: u16,
    pub threshold_var: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            number_of_agents: 20,
            http_timeout_secs: 30,
            user_agent: "scorewatch/0.1".to_string(),
            store_kind: StoreKind::Memory,
            data_dir: PathBuf::from("."),
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            boundary_rule: BoundaryRule::AtMark,
            run_on_start: true,
            web_port: 5000,
            threshold_var: THRESHOLD_ENV_VAR.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store_kind = match lookup("SCOREWATCH_STORE") {
            Some(raw) => raw.parse().map_err(|err: scorewatch_storage::UnknownStoreKind| {
                ConfigError::Invalid {
                    key: "SCOREWATCH_STORE",
                    message: err.to_string(),
                }
            })?,
            None => defaults.store_kind,
        };
        let boundary_rule = match lookup("SCOREWATCH_SCHEDULE_BOUNDARY") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::Invalid {
                key: "SCOREWATCH_SCHEDULE_BOUNDARY",
                message,
            })?,
            None => defaults.boundary_rule,
        };

        let interval_minutes = lookup("SCOREWATCH_INTERVAL_MINUTES")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults.interval_minutes);
        let interval_minutes = if is_valid_interval(interval_minutes) {
            interval_minutes
        } else {
            warn!(
                interval_minutes,
                "interval must divide an hour evenly; falling back to {DEFAULT_INTERVAL_MINUTES}"
            );
            DEFAULT_INTERVAL_MINUTES
        };

        Ok(Self {
            api_url: lookup("SCOREWATCH_API_URL").unwrap_or(defaults.api_url),
            number_of_agents: lookup("SCOREWATCH_NUMBER_OF_AGENTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.number_of_agents),
            http_timeout_secs: lookup("SCOREWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: lookup("SCOREWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            store_kind,
            data_dir: lookup("SCOREWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            interval_minutes,
            boundary_rule,
            run_on_start: lookup("SCOREWATCH_RUN_ON_START")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.run_on_start),
            web_port: lookup("SCOREWATCH_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.web_port),
            threshold_var: defaults.threshold_var,
        })
    }

    pub fn interval_label(&self) -> String {
        interval_label(self.interval_minutes)
    }
}

pub fn interval_label(interval_minutes: u32) -> String {
    format!("every {interval_minutes} minutes (exact marks)")
}

fn is_valid_interval(minutes: u32) -> bool {
    (1..=60).contains(&minutes) && 60 % minutes == 0
}

#[derive(Debug, Error)]
#[error("threshold `{raw}` is not an integer: {source}")]
pub struct ThresholdError {
    pub raw: String,
    #[source]
    pub source: std::num::ParseIntError,
}

/// Where the per-cycle score threshold comes from. Read on every cycle so the
/// value can change without a restart.
pub trait ThresholdSource: Send + Sync {
    /// The configured value as text, `None` when unset.
    fn raw(&self) -> Option<String>;

    fn threshold(&self) -> Result<i64, ThresholdError> {
        match self.raw() {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|source| ThresholdError { raw, source }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvThreshold {
    var: String,
}

impl EnvThreshold {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvThreshold {
    fn default() -> Self {
        Self::new(THRESHOLD_ENV_VAR)
    }
}

impl ThresholdSource for EnvThreshold {
    fn raw(&self) -> Option<String> {
        std::env::var(&self.var).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixedThreshold(pub Option<String>);

impl FixedThreshold {
    pub fn value(threshold: i64) -> Self {
        Self(Some(threshold.to_string()))
    }
}

impl ThresholdSource for FixedThreshold {
    fn raw(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Next wall-clock instant whose minute is a multiple of `interval_minutes`
/// and whose seconds are zero.
///
/// Works on naive local time, so across a DST shift the real delay can be off
/// by up to the size of the shift (one hour in most zones).
pub fn next_mark(now: NaiveDateTime, interval_minutes: u32, rule: BoundaryRule) -> NaiveDateTime {
    let interval = if is_valid_interval(interval_minutes) {
        interval_minutes
    } else {
        DEFAULT_INTERVAL_MINUTES
    };
    let floor_minute = (now.minute() / interval) * interval;
    let floor = now
        .date()
        .and_hms_opt(now.hour(), floor_minute, 0)
        .unwrap_or(now);
    let step = ChronoDuration::minutes(i64::from(interval));

    match rule {
        BoundaryRule::AtMark if floor == now => floor,
        _ => floor + step,
    }
}

/// How long to sleep from `now` until [`next_mark`].
pub fn delay_until_next_mark(now: NaiveDateTime, interval_minutes: u32, rule: BoundaryRule) -> Duration {
    (next_mark(now, interval_minutes, rule) - now)
        .to_std()
        .unwrap_or_default()
}

/// Plans sleeps between marks and refuses to fire the same mark twice, which
/// can otherwise happen when the task wakes a hair before the wall clock
/// reaches the mark.
#[derive(Debug, Clone)]
pub struct MarkScheduler {
    interval_minutes: u32,
    rule: BoundaryRule,
    last_fired: Option<NaiveDateTime>,
}

impl MarkScheduler {
    pub fn new(interval_minutes: u32, rule: BoundaryRule) -> Self {
        Self {
            interval_minutes,
            rule,
            last_fired: None,
        }
    }

    pub fn plan(&self, now: NaiveDateTime) -> (NaiveDateTime, Duration) {
        let mut mark = next_mark(now, self.interval_minutes, self.rule);
        if self.last_fired.is_some_and(|fired| mark <= fired) {
            mark = next_mark(mark, self.interval_minutes, BoundaryRule::NextMark);
        }
        let delay = (mark - now).to_std().unwrap_or_default();
        (mark, delay)
    }

    pub fn mark_fired(&mut self, mark: NaiveDateTime) {
        self.last_fired = Some(mark);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub timestamp: String,
    pub fetched_items: usize,
    pub saved_agents: usize,
    pub new_agents: usize,
    pub total_diff: i64,
    pub threshold: i64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: AgentFetcher,
    store: Arc<dyn ScoreStore>,
    threshold: Arc<dyn ThresholdSource>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn ScoreStore>) -> Result<Self> {
        let fetcher = AgentFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
            config.api_url.clone(),
            config.number_of_agents,
        )?;
        let threshold = Arc::new(EnvThreshold::new(config.threshold_var.clone()));
        Ok(Self {
            config,
            fetcher,
            store,
            threshold,
        })
    }

    pub fn with_threshold(mut self, threshold: Arc<dyn ThresholdSource>) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ScoreStore> {
        Arc::clone(&self.store)
    }

    pub fn threshold_source(&self) -> Arc<dyn ThresholdSource> {
        Arc::clone(&self.threshold)
    }

    /// One fetch/diff/persist cycle. Any error leaves the store untouched.
    pub async fn run_once(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, store = %self.store.kind());
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<CycleSummary> {
        let items = self
            .fetcher
            .fetch_top_agents()
            .await
            .with_context(|| format!("fetching {}", self.fetcher.url()))?;
        let threshold = self.threshold.threshold().context("reading score threshold")?;
        let previous = self
            .store
            .load_snapshot()
            .await
            .context("loading previous snapshot")?;

        let scores = parse_agent_scores(&items);
        let outcome = diff_new_agents(&previous, &scores, threshold);
        let entry = DiffLogEntry::stamped(Local::now().naive_local(), outcome.total_diff);

        self.store
            .commit_cycle(&outcome.snapshot, &entry)
            .await
            .context("persisting cycle results")?;

        info!(
            saved_agents = outcome.snapshot.len(),
            new_agents = outcome.new_agents.len(),
            total_diff = outcome.total_diff,
            threshold,
            "saved agents; sum of (rounded_score - threshold) over new agents = {}",
            outcome.total_diff
        );

        Ok(CycleSummary {
            run_id,
            timestamp: entry.timestamp,
            fetched_items: items.len(),
            saved_agents: outcome.snapshot.len(),
            new_agents: outcome.new_agents.len(),
            total_diff: outcome.total_diff,
            threshold,
        })
    }

    /// Runs a cycle and reports failure through the log instead of the caller.
    pub async fn run_once_logged(&self) -> Option<CycleSummary> {
        match self.run_once().await {
            Ok(summary) => Some(summary),
            Err(err) => {
                let timed_out = err
                    .downcast_ref::<FetchError>()
                    .is_some_and(is_timeout);
                error!(timed_out, "sync cycle failed, state left unchanged: {err:#}");
                None
            }
        }
    }

    /// Runs forever: optionally once at start, then once per aligned mark.
    pub async fn run_forever(&self) {
        if self.config.run_on_start {
            self.run_once_logged().await;
        }

        let mut scheduler = MarkScheduler::new(self.config.interval_minutes, self.config.boundary_rule);
        loop {
            let (mark, delay) = scheduler.plan(Local::now().naive_local());
            info!(
                next_run = %mark,
                "sleeping for {} seconds until next mark",
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
            scheduler.mark_fired(mark);
            self.run_once_logged().await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_forever().await })
    }
}

pub fn pipeline_from_config(config: SyncConfig) -> Result<SyncPipeline> {
    let store = open_store(config.store_kind, config.data_dir.clone());
    SyncPipeline::new(config, store)
}
