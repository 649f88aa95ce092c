//! Per-locator job state and the context threaded through every stage.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ConfigError, Settings};
use crate::model::{Jurisdiction, RecordLocator, RecordStatus};
use crate::platforms::PlatformAdapter;
use crate::session::{AutomationSession, DriverFactory, FetchError, SessionOptions};

const MAX_BACKOFF: Duration = Duration::from_secs(120);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// ── Job state ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Discovered,
    Fetched,
    Extracted,
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    At(Stage),
    /// Absorbing: nothing moves a job out of here.
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub locator: RecordLocator,
    pub state: JobState,
    pub status: JobStatus,
    pub attempts: u32,
}

impl Job {
    pub fn new(locator: RecordLocator) -> Self {
        Job {
            locator,
            state: JobState::At(Stage::Discovered),
            status: JobStatus::Pending,
            attempts: 0,
        }
    }

    pub fn stage(&self) -> Stage {
        match &self.state {
            JobState::At(stage) | JobState::Failed { stage, .. } => *stage,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Abandoned
        )
    }

    pub fn begin_attempt(&mut self) {
        if self.status == JobStatus::Pending {
            self.attempts += 1;
            self.status = JobStatus::Running;
        }
    }

    /// Explicit retry scheduling; the only way back to `Pending`.
    pub fn schedule_retry(&mut self) {
        if self.status == JobStatus::Running {
            self.status = JobStatus::Pending;
        }
    }

    /// Move strictly forward. Returns false when the move is refused.
    pub fn advance(&mut self, next: Stage) -> bool {
        match self.state {
            JobState::At(current) if next > current => {
                self.state = JobState::At(next);
                if next == Stage::Persisted && !self.is_terminal() {
                    self.status = JobStatus::Succeeded;
                }
                true
            }
            _ => false,
        }
    }

    /// Non-retryable failure while working towards `stage`.
    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        self.fail_with(JobStatus::Failed, stage, reason.into());
    }

    /// Retry budget spent while working towards `stage`.
    pub fn abandon(&mut self, stage: Stage, reason: impl Into<String>) {
        self.fail_with(JobStatus::Abandoned, stage, reason.into());
    }

    fn fail_with(&mut self, status: JobStatus, stage: Stage, reason: String) {
        if let JobState::At(_) = self.state {
            self.state = JobState::Failed { stage, reason };
            self.status = status;
        }
    }
}

// ── Context ──

/// Serialises fetches per jurisdiction with a random gap between them.
pub struct PolitenessGates {
    range: RangeInclusive<Duration>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Instant>>>>>,
}

impl PolitenessGates {
    pub fn new(range: RangeInclusive<Duration>) -> Self {
        PolitenessGates {
            range,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, jurisdiction: &str) -> Arc<tokio::sync::Mutex<Option<Instant>>> {
        let mut gates = match self.gates.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(gates.entry(jurisdiction.to_string()).or_default())
    }

    fn pick(&self) -> Duration {
        let (lo, hi) = (self.range.start().as_millis() as u64, self.range.end().as_millis() as u64);
        if hi == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    /// Wait out the politeness gap since the last fetch in `jurisdiction`.
    pub async fn wait(&self, jurisdiction: &str) {
        let gate = self.gate(jurisdiction);
        let mut last = gate.lock().await;
        if let Some(previous) = *last {
            let gap = self.pick();
            let ready_at = previous + gap;
            if ready_at > Instant::now() {
                debug!(jurisdiction, gap_ms = gap.as_millis() as u64, "politeness delay");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Everything a stage needs, passed explicitly instead of held globally.
pub struct JobContext {
    pub settings: Arc<Settings>,
    pub adapter: Arc<dyn PlatformAdapter>,
    pub factory: Arc<dyn DriverFactory>,
    pub options: SessionOptions,
    pub cancel: CancellationToken,
    limiter: DirectLimiter,
    gates: PolitenessGates,
}

impl JobContext {
    pub fn new(
        settings: Arc<Settings>,
        adapter: Arc<dyn PlatformAdapter>,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, ConfigError> {
        let rate = NonZeroU32::new(settings.rate_per_minute).ok_or(ConfigError::Invalid {
            key: "rate_per_minute",
            reason: "must be greater than zero".into(),
        })?;
        let quota = Quota::per_minute(rate).allow_burst(NonZeroU32::MIN);
        Ok(JobContext {
            options: SessionOptions::from_settings(&settings),
            gates: PolitenessGates::new(settings.politeness_delay()),
            limiter: RateLimiter::direct(quota),
            cancel: CancellationToken::new(),
            settings,
            adapter,
            factory,
        })
    }

    /// Global rate ceiling plus the per-jurisdiction gap, before any fetch.
    pub async fn throttle(&self, jurisdiction: &str) {
        self.limiter.until_ready().await;
        self.gates.wait(jurisdiction).await;
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.settings.base_backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// Session ownership plus retry bookkeeping for one unit of work.
pub struct Attempts<'a> {
    ctx: &'a JobContext,
    session: Option<AutomationSession>,
    made: u32,
}

impl<'a> Attempts<'a> {
    pub fn new(ctx: &'a JobContext) -> Self {
        Attempts {
            ctx,
            session: None,
            made: 0,
        }
    }

    pub fn made(&self) -> u32 {
        self.made
    }

    /// Start an attempt, creating a session if none is alive.
    pub fn session(&mut self) -> Result<&mut AutomationSession, FetchError> {
        self.made += 1;
        if self.session.is_none() {
            let session = AutomationSession::create(self.ctx.factory.as_ref(), &self.ctx.options)?;
            self.session = Some(session);
        }
        match self.session.as_mut() {
            Some(s) => Ok(s),
            None => Err(crate::session::SessionError::crashed("session unavailable").into()),
        }
    }

    /// After a failed attempt: true when another attempt should follow.
    pub async fn retry_after(&mut self, err: &FetchError, what: &str) -> bool {
        if !err.is_retryable() || self.made > self.ctx.settings.max_retries {
            return false;
        }
        if err.needs_fresh_session() {
            debug!(what, "discarding session");
            self.session = None;
        }
        let backoff = self.ctx.backoff(self.made);
        warn!(
            what,
            attempt = self.made,
            max_retries = self.ctx.settings.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "retrying"
        );
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
        true
    }
}

// ── Statistics ──

/// Shorten a jurisdiction label to `width` chars, keeping its state suffix.
fn fit_label(label: &str, width: usize) -> String {
    if label.chars().count() <= width {
        return label.to_string();
    }
    let (head, tail) = match label.rsplit_once(", ") {
        Some((head, state)) if state.chars().count() + 4 < width => (head, format!(", {}", state)),
        _ => (label, String::new()),
    };
    let keep = width.saturating_sub(tail.chars().count() + 1);
    let head: String = head.chars().take(keep).collect();
    format!("{}…{}", head, tail)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub discovered: u64,
    pub skipped: u64,
    pub fetched: u64,
    pub complete: u64,
    pub partial: u64,
    pub failed: u64,
}

impl Counts {
    fn add(&mut self, other: &Counts) {
        self.discovered += other.discovered;
        self.skipped += other.skipped;
        self.fetched += other.fetched;
        self.complete += other.complete;
        self.partial += other.partial;
        self.failed += other.failed;
    }
}

/// Per-jurisdiction and aggregate counts for one batch.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub by_jurisdiction: BTreeMap<String, Counts>,
    pub cancelled: bool,
}

impl RunStats {
    pub fn entry(&mut self, jurisdiction: &Jurisdiction) -> &mut Counts {
        self.by_jurisdiction
            .entry(format!("{} {}", jurisdiction.platform, jurisdiction.label()))
            .or_default()
    }

    pub fn record(&mut self, locator: &RecordLocator, status: RecordStatus, fetched: bool) {
        let c = self.entry(&locator.jurisdiction);
        if fetched {
            c.fetched += 1;
        }
        match status {
            RecordStatus::Complete => c.complete += 1,
            RecordStatus::Partial => c.partial += 1,
            RecordStatus::Failed => c.failed += 1,
        }
    }

    pub fn merge(&mut self, other: RunStats) {
        for (name, counts) in other.by_jurisdiction {
            self.by_jurisdiction.entry(name).or_default().add(&counts);
        }
        self.cancelled |= other.cancelled;
    }

    pub fn total(&self) -> Counts {
        let mut total = Counts::default();
        for c in self.by_jurisdiction.values() {
            total.add(c);
        }
        total
    }

    pub fn print(&self) {
        println!(
            "{:<40} | {:>10} | {:>7} | {:>7} | {:>8} | {:>7} | {:>6}",
            "Jurisdiction", "Discovered", "Skipped", "Fetched", "Complete", "Partial", "Failed"
        );
        println!("{}", "-".repeat(104));
        let total = self.total();
        let rows = self
            .by_jurisdiction
            .iter()
            .map(|(k, c)| (k.as_str(), c))
            .chain(std::iter::once(("TOTAL", &total)));
        for (name, c) in rows {
            println!(
                "{:<40} | {:>10} | {:>7} | {:>7} | {:>8} | {:>7} | {:>6}",
                fit_label(name, 40),
                c.discovered,
                c.skipped,
                c.fetched,
                c.complete,
                c.partial,
                c.failed
            );
        }
        if self.cancelled {
            println!("\nBatch cancelled: remaining locators were not scheduled.");
        }
    }
}
