//! Core domain model and scheduling rules for listwatch.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-core";

pub const MIN_FREQUENCY_MINUTES: u32 = 2;
pub const MAX_FREQUENCY_MINUTES: u32 = 10_080;
pub const DEFAULT_FREQUENCY_MINUTES: u32 = 120;
pub const DEFAULT_DISTANCE_MILES: u32 = 15;
pub const DEFAULT_INITIAL_SCRAPE_COUNT: u32 = 6;
pub const TASK_LOG_CAPACITY: usize = 50;
/// Consecutive fetch failures after which a task reports as degraded.
pub const DEGRADED_AFTER_SOURCE_FAILURES: u32 = 3;

/// Match strictness tier selected per task. Thresholds are fixed per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    LessStrict,
    #[default]
    Strict,
    VeryStrict,
}

impl Strictness {
    pub const ALL: [Strictness; 3] = [Self::LessStrict, Self::Strict, Self::VeryStrict];

    pub fn threshold(self) -> f64 {
        match self {
            Self::LessStrict => 0.50,
            Self::Strict => 0.70,
            Self::VeryStrict => 0.85,
        }
    }

    /// Inclusive at the boundary: a score equal to the threshold passes.
    pub fn passes(self, score: f64) -> bool {
        score >= self.threshold()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LessStrict => "less_strict",
            Self::Strict => "strict",
            Self::VeryStrict => "very_strict",
        }
    }
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown strictness tier `{0}` (expected less_strict, strict or very_strict)")]
pub struct UnknownStrictness(pub String);

impl FromStr for Strictness {
    type Err = UnknownStrictness;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStrictness(s.to_string()))
    }
}

/// A marketplace listing as observed at scrape time.
///
/// Identity is the marketplace-assigned `id`; title or price edits on the
/// marketplace do not create a new entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn same_entity(&self, other: &Listing) -> bool {
        self.id == other.id
    }
}

/// Per-listing scoring outcome for a single run. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub listing_id: String,
    pub score: f64,
    pub rationale: String,
    pub passed_threshold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_error: Option<String>,
}

impl MatchResult {
    pub fn evaluate(
        listing_id: impl Into<String>,
        score: f64,
        rationale: impl Into<String>,
        strictness: Strictness,
    ) -> Self {
        let score = clamp_score(score);
        Self {
            listing_id: listing_id.into(),
            score,
            rationale: rationale.into(),
            passed_threshold: strictness.passes(score),
            scoring_error: None,
        }
    }

    /// An unscoreable listing scores zero and never passes.
    pub fn fail_closed(listing_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            listing_id: listing_id.into(),
            score: 0.0,
            rationale: format!("scoring failed: {error}"),
            passed_threshold: false,
            scoring_error: Some(error),
        }
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TaskLogEntry {
    pub fn new(timestamp: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Fixed-capacity, append-only task log. The oldest entry is evicted once
/// [`TASK_LOG_CAPACITY`] is reached. Serializes as a plain array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TaskLogEntry>", into = "Vec<TaskLogEntry>")]
pub struct TaskLog {
    entries: VecDeque<TaskLogEntry>,
}

impl TaskLog {
    pub fn push(&mut self, entry: TaskLogEntry) {
        while self.entries.len() >= TASK_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&TaskLogEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskLogEntry> {
        self.entries.iter()
    }
}

impl From<Vec<TaskLogEntry>> for TaskLog {
    fn from(entries: Vec<TaskLogEntry>) -> Self {
        let skip = entries.len().saturating_sub(TASK_LOG_CAPACITY);
        Self {
            entries: entries.into_iter().skip(skip).collect(),
        }
    }
}

impl From<TaskLog> for Vec<TaskLogEntry> {
    fn from(log: TaskLog) -> Self {
        log.entries.into_iter().collect()
    }
}

/// A user's monitoring configuration plus its lifecycle counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub location: String,
    pub distance: u32,
    pub frequency_minutes: u32,
    pub notification_target: String,
    pub strictness: Strictness,
    pub is_active: bool,
    pub enable_initial_scrape: bool,
    pub initial_scrape_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_cooldown: DateTime<Utc>,
    pub total_runs: u64,
    pub total_scrapes: u64,
    pub total_matches: u64,
    #[serde(default)]
    pub consecutive_source_failures: u32,
    #[serde(default)]
    pub logs: TaskLog,
}

impl Task {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        is_eligible(self.is_active, self.next_cooldown, now)
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_source_failures >= DEGRADED_AFTER_SOURCE_FAILURES
    }

    pub fn schedule_state(&self, now: DateTime<Utc>, running: bool) -> ScheduleState {
        if running {
            ScheduleState::Running
        } else if self.is_eligible(now) {
            ScheduleState::Eligible
        } else {
            ScheduleState::Idle
        }
    }

    pub fn status(&self, now: DateTime<Utc>, running: bool) -> TaskStatus {
        if running {
            TaskStatus::Running
        } else if !self.is_active {
            TaskStatus::Paused
        } else if self.is_degraded() {
            TaskStatus::Degraded
        } else if self.is_eligible(now) {
            TaskStatus::Eligible
        } else {
            TaskStatus::Idle
        }
    }

    /// Pausing freezes the schedule: `next_cooldown` is left untouched.
    pub fn pause(&mut self, now: DateTime<Utc>) {
        if self.is_active {
            self.is_active = false;
            self.logs
                .push(TaskLogEntry::new(now, LogLevel::Info, "Task paused"));
        }
    }

    /// Returns whether the task is eligible straight away, which is only the
    /// case when its cooldown had already elapsed.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            self.is_active = true;
            let details = if now >= self.next_cooldown {
                "cooldown elapsed; eligible on the next tick".to_string()
            } else {
                format!("waiting out cooldown until {}", self.next_cooldown.to_rfc3339())
            };
            self.logs.push(
                TaskLogEntry::new(now, LogLevel::Info, "Task resumed").with_details(details),
            );
        }
        self.is_eligible(now)
    }

    /// Applies a run commit's counters, schedule and log entry. Seen records
    /// are the store's responsibility.
    pub fn apply_commit(&mut self, commit: &RunCommit) {
        if commit.count_run {
            self.total_runs += 1;
        }
        self.total_scrapes += commit.scraped;
        self.total_matches += commit.matches;
        match commit.fetch {
            FetchStatus::Succeeded => self.consecutive_source_failures = 0,
            FetchStatus::Failed => self.consecutive_source_failures += 1,
            FetchStatus::NotAttempted => {}
        }
        if commit.advance_cooldown {
            self.last_run = Some(commit.completed_at);
            self.next_cooldown = next_eligible_time(commit.completed_at, self.frequency_minutes);
        }
        if let Some(entry) = &commit.log_entry {
            self.logs.push(entry.clone());
        }
    }
}

/// Cooldown is measured from run completion, not from the previous slot.
pub fn next_eligible_time(completed_at: DateTime<Utc>, frequency_minutes: u32) -> DateTime<Utc> {
    completed_at + Duration::minutes(i64::from(frequency_minutes))
}

pub fn is_eligible(is_active: bool, next_cooldown: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    is_active && now >= next_cooldown
}

pub fn clamp_frequency(minutes: u32) -> u32 {
    minutes.clamp(MIN_FREQUENCY_MINUTES, MAX_FREQUENCY_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Idle,
    Eligible,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Eligible,
    Running,
    Paused,
    Degraded,
    NotFound,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("initial_scrape_count must be at least 1 when the initial scrape is enabled")]
    InitialScrapeCount,
}

fn default_task_name() -> String {
    "Untitled Task".to_string()
}

fn default_distance() -> u32 {
    DEFAULT_DISTANCE_MILES
}

fn default_frequency() -> u32 {
    DEFAULT_FREQUENCY_MINUTES
}

fn default_true() -> bool {
    true
}

fn default_initial_scrape_count() -> u32 {
    DEFAULT_INITIAL_SCRAPE_COUNT
}

/// Task creation request as submitted by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: String,
    #[serde(default = "default_task_name")]
    pub name: String,
    pub description: String,
    pub location: String,
    #[serde(default = "default_distance")]
    pub distance: u32,
    #[serde(default = "default_frequency")]
    pub frequency_minutes: u32,
    pub notification_target: String,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default = "default_true")]
    pub enable_initial_scrape: bool,
    #[serde(default = "default_initial_scrape_count")]
    pub initial_scrape_count: u32,
}

impl NewTask {
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        let required = [
            ("user_id", &self.user_id),
            ("description", &self.description),
            ("location", &self.location),
            ("notification_target", &self.notification_target),
        ];
        if let Some((name, _)) = required.into_iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(TaskValidationError::MissingField(name));
        }
        if self.enable_initial_scrape && self.initial_scrape_count == 0 {
            return Err(TaskValidationError::InitialScrapeCount);
        }
        Ok(())
    }

    /// Builds the persisted task. The frequency is clamped to the allowed
    /// range regardless of user input.
    pub fn into_task(
        self,
        id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Task, TaskValidationError> {
        self.validate()?;
        let frequency_minutes = clamp_frequency(self.frequency_minutes);
        let mut logs = TaskLog::default();
        logs.push(
            TaskLogEntry::new(now, LogLevel::Success, "Task created successfully").with_details(
                format!(
                    "Task \"{}\" created with {} minute frequency",
                    self.name.trim(),
                    frequency_minutes
                ),
            ),
        );
        Ok(Task {
            id: id.into(),
            user_id: self.user_id.trim().to_string(),
            name: self.name.trim().to_string(),
            description: self.description.trim().to_string(),
            location: self.location.trim().to_string(),
            distance: self.distance,
            frequency_minutes,
            notification_target: self.notification_target.trim().to_string(),
            strictness: self.strictness,
            is_active: true,
            enable_initial_scrape: self.enable_initial_scrape,
            initial_scrape_count: self.initial_scrape_count,
            created_at: now,
            last_run: None,
            next_cooldown: next_eligible_time(now, frequency_minutes),
            total_runs: 0,
            total_scrapes: 0,
            total_matches: 0,
            consecutive_source_failures: 0,
            logs,
        })
    }
}

/// Mutual-exclusion token for a single task run. Expires so a crashed run
/// cannot block its task forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub task_id: String,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn new(task_id: impl Into<String>, owner: Uuid, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            owner,
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Succeeded,
    Failed,
    NotAttempted,
}

/// Everything a run writes back, applied by the store as one atomic unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommit {
    pub task_id: String,
    pub lease_owner: Uuid,
    pub completed_at: DateTime<Utc>,
    pub seen_listing_ids: Vec<String>,
    pub scraped: u64,
    pub matches: u64,
    pub count_run: bool,
    pub fetch: FetchStatus,
    pub advance_cooldown: bool,
    pub log_entry: Option<TaskLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Seen records that did not exist before this commit.
    pub newly_seen: usize,
    pub next_cooldown: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    SourceUnavailable,
    ScoringFailed,
    DeliveryFailed,
    StoreUnavailable,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::ScoringFailed => "scoring_failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::StoreUnavailable => "store_unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            listing_id: None,
            message: message.into(),
        }
    }

    pub fn for_listing(kind: RunErrorKind, listing_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            listing_id: Some(listing_id.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TaskLocked,
    Paused,
    /// A scheduled run found the task back inside its cooldown.
    CoolingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    SourceUnavailable,
    Cancelled,
    Seeded,
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub listings_fetched: usize,
    pub new_count: usize,
    pub matches_found: usize,
    pub notified: usize,
    pub errors: Vec<RunError>,
}

impl RunSummary {
    pub fn skipped(task_id: &str, run_id: Uuid, now: DateTime<Utc>, reason: SkipReason) -> Self {
        Self {
            run_id,
            task_id: task_id.to_string(),
            started_at: now,
            finished_at: now,
            outcome: RunOutcome::Skipped { reason },
            listings_fetched: 0,
            new_count: 0,
            matches_found: 0,
            notified: 0,
            errors: Vec::new(),
        }
    }

    pub fn was_skipped(&self) -> bool {
        matches!(self.outcome, RunOutcome::Skipped { .. })
    }
}

/// Time source injected into the scheduler and pipeline.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic scheduling tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn new_task() -> NewTask {
        NewTask {
            user_id: "user-1".into(),
            name: "Road bike".into(),
            description: "road bike 54cm shimano 105".into(),
            location: "94105".into(),
            distance: 15,
            frequency_minutes: 120,
            notification_target: "https://discord.test/hook".into(),
            strictness: Strictness::Strict,
            enable_initial_scrape: true,
            initial_scrape_count: 6,
        }
    }

    #[test]
    fn very_strict_boundary_is_inclusive() {
        assert!(!Strictness::VeryStrict.passes(0.84));
        assert!(Strictness::VeryStrict.passes(0.85));
        assert!(MatchResult::evaluate("a", 0.85, "ok", Strictness::VeryStrict).passed_threshold);
        let close = MatchResult::evaluate("b", 0.84, "close", Strictness::VeryStrict);
        assert!(!close.passed_threshold);
    }

    #[test]
    fn tier_thresholds_are_fixed() {
        assert_eq!(Strictness::LessStrict.threshold(), 0.50);
        assert_eq!(Strictness::Strict.threshold(), 0.70);
        assert_eq!(Strictness::VeryStrict.threshold(), 0.85);
        assert_eq!("very_strict".parse::<Strictness>(), Ok(Strictness::VeryStrict));
        assert!("lenient".parse::<Strictness>().is_err());
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let high = MatchResult::evaluate("a", 1.7, "", Strictness::Strict);
        assert_eq!(high.score, 1.0);
        let nan = MatchResult::evaluate("b", f64::NAN, "", Strictness::LessStrict);
        assert_eq!(nan.score, 0.0);
        assert!(!nan.passed_threshold);
    }

    #[test]
    fn fail_closed_never_passes() {
        let result = MatchResult::fail_closed("x", "timeout");
        assert_eq!(result.score, 0.0);
        assert!(!result.passed_threshold);
        assert_eq!(result.scoring_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn task_log_evicts_oldest_entries() {
        let mut log = TaskLog::default();
        for i in 0..(TASK_LOG_CAPACITY + 5) {
            log.push(TaskLogEntry::new(t0(), LogLevel::Info, format!("entry {i}")));
        }
        assert_eq!(log.len(), TASK_LOG_CAPACITY);
        assert_eq!(log.iter().next().unwrap().message, "entry 5");
        assert_eq!(
            log.latest().unwrap().message,
            format!("entry {}", TASK_LOG_CAPACITY + 4)
        );

        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json.as_array().unwrap().len(), TASK_LOG_CAPACITY);
    }

    #[test]
    fn new_task_clamps_frequency_and_sets_cooldown() {
        let mut req = new_task();
        req.frequency_minutes = 1;
        let task = req.into_task("t-1", t0()).unwrap();
        assert_eq!(task.frequency_minutes, MIN_FREQUENCY_MINUTES);
        assert_eq!(task.next_cooldown, t0() + Duration::minutes(2));
        assert!(task.last_run.is_none());
        assert_eq!(task.logs.len(), 1);

        let mut req = new_task();
        req.frequency_minutes = 50_000;
        let task = req.into_task("t-2", t0()).unwrap();
        assert_eq!(task.frequency_minutes, MAX_FREQUENCY_MINUTES);
    }

    #[test]
    fn new_task_requires_core_fields() {
        let mut req = new_task();
        req.notification_target = "  ".into();
        assert_eq!(
            req.validate(),
            Err(TaskValidationError::MissingField("notification_target"))
        );

        let mut req = new_task();
        req.initial_scrape_count = 0;
        assert_eq!(req.validate(), Err(TaskValidationError::InitialScrapeCount));
        req.enable_initial_scrape = false;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn eligibility_follows_cooldown_and_active_flag() {
        let mut task = new_task().into_task("t", t0()).unwrap();
        assert!(!task.is_eligible(t0()));
        assert_eq!(task.schedule_state(t0(), false), ScheduleState::Idle);

        let later = t0() + Duration::minutes(120);
        assert!(task.is_eligible(later));
        assert_eq!(task.schedule_state(later, false), ScheduleState::Eligible);
        assert_eq!(task.schedule_state(later, true), ScheduleState::Running);

        task.pause(later);
        assert!(!task.is_eligible(later));
        assert_eq!(task.status(later, false), TaskStatus::Paused);
    }

    #[test]
    fn pause_freezes_and_resume_respects_remaining_cooldown() {
        let mut task = new_task().into_task("t", t0()).unwrap();
        let cooldown = task.next_cooldown;

        task.pause(t0() + Duration::minutes(10));
        assert_eq!(task.next_cooldown, cooldown);

        assert!(!task.resume(t0() + Duration::minutes(30)));
        assert_eq!(task.next_cooldown, cooldown);

        task.pause(t0() + Duration::minutes(31));
        assert!(task.resume(t0() + Duration::minutes(200)));
    }

    #[test]
    fn commit_advances_cooldown_from_completion() {
        let mut task = new_task().into_task("t", t0()).unwrap();
        let done = t0() + Duration::minutes(125);
        task.apply_commit(&RunCommit {
            task_id: "t".into(),
            lease_owner: Uuid::new_v4(),
            completed_at: done,
            seen_listing_ids: vec!["a".into(), "b".into()],
            scraped: 2,
            matches: 1,
            count_run: true,
            fetch: FetchStatus::Succeeded,
            advance_cooldown: true,
            log_entry: Some(TaskLogEntry::new(done, LogLevel::Success, "Found 1 matches")),
        });
        assert_eq!(task.total_runs, 1);
        assert_eq!(task.total_scrapes, 2);
        assert_eq!(task.total_matches, 1);
        assert_eq!(task.last_run, Some(done));
        assert_eq!(task.next_cooldown, done + Duration::minutes(120));
        assert!(task.next_cooldown >= task.last_run.unwrap() + Duration::minutes(120));
    }

    #[test]
    fn repeated_fetch_failures_mark_task_degraded() {
        let mut task = new_task().into_task("t", t0()).unwrap();
        let failed = RunCommit {
            task_id: "t".into(),
            lease_owner: Uuid::new_v4(),
            completed_at: t0(),
            seen_listing_ids: vec![],
            scraped: 0,
            matches: 0,
            count_run: true,
            fetch: FetchStatus::Failed,
            advance_cooldown: true,
            log_entry: None,
        };
        for _ in 0..DEGRADED_AFTER_SOURCE_FAILURES {
            task.apply_commit(&failed);
        }
        assert!(task.is_degraded());
        assert!(task.is_active);

        let ok = RunCommit {
            fetch: FetchStatus::Succeeded,
            ..failed
        };
        task.apply_commit(&ok);
        assert!(!task.is_degraded());
    }

    #[test]
    fn lease_expiry_is_inclusive() {
        let lease = RunLease::new("t", Uuid::new_v4(), t0(), Duration::seconds(60));
        assert!(!lease.is_expired(t0() + Duration::seconds(59)));
        assert!(lease.is_expired(t0() + Duration::seconds(60)));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), t0() + Duration::minutes(5));
    }
}
