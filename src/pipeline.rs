//! Discovery, then a bounded fan-out of fetch → extract → persist jobs.
//!
//! Jobs run concurrently and hand their outcome to a single writer loop,
//! which is the only code touching the store.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::job::{Attempts, Job, JobContext, RunStats, Stage};
use crate::model::{CanonicalRecord, Jurisdiction, RawPage, RecordLocator};
use crate::store::Store;

/// What one job produced; always persisted, whatever the status.
pub struct JobOutcome {
    pub job: Job,
    pub record: CanonicalRecord,
    pub page: Option<RawPage>,
}

pub struct DiscoveryReport {
    pub jurisdictions: Vec<Jurisdiction>,
    pub locators: Vec<RecordLocator>,
    /// Jurisdictions whose locator discovery failed, with the cause.
    pub failed: Vec<(Jurisdiction, String)>,
    pub stats: RunStats,
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

// ── Discovery ──

/// Enumerate jurisdictions from `seed`, then every locator in each, storing both.
pub async fn discover(ctx: &JobContext, store: &Store, seed: &str) -> Result<DiscoveryReport> {
    let adapter = Arc::clone(&ctx.adapter);
    let mut report = DiscoveryReport {
        jurisdictions: Vec::new(),
        locators: Vec::new(),
        failed: Vec::new(),
        stats: RunStats::default(),
    };

    let mut attempts = Attempts::new(ctx);
    let jurisdictions = loop {
        let result = match attempts.session() {
            Ok(session) => adapter.discover_jurisdictions(session, seed).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(found) => break found,
            Err(e) if attempts.retry_after(&e, seed).await => continue,
            Err(e) => {
                error!(platform = %adapter.platform(), seed, error = %e, "jurisdiction discovery failed");
                return Ok(report);
            }
        }
    };
    drop(attempts);

    store.save_jurisdictions(&jurisdictions)?;
    info!(platform = %adapter.platform(), count = jurisdictions.len(), "jurisdictions discovered");

    for jurisdiction in &jurisdictions {
        if ctx.cancel.is_cancelled() {
            report.stats.cancelled = true;
            warn!("cancelled; remaining jurisdictions not enumerated");
            break;
        }

        let mut attempts = Attempts::new(ctx);
        let found = loop {
            ctx.throttle(&jurisdiction.url).await;
            let result = match attempts.session() {
                Ok(session) => adapter.discover_locators(session, jurisdiction).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(found) => break Ok(found),
                Err(e) if attempts.retry_after(&e, &jurisdiction.url).await => continue,
                Err(e) => break Err(e),
            }
        };

        match found {
            Ok(locators) => {
                store
                    .save_locators(&locators)
                    .with_context(|| format!("saving locators for {}", jurisdiction.label()))?;
                report.stats.entry(jurisdiction).discovered += locators.len() as u64;
                report.locators.extend(locators);
            }
            Err(e) => {
                warn!(county = %jurisdiction.label(), error = %e, "locator discovery failed");
                report.stats.entry(jurisdiction);
                report.failed.push((jurisdiction.clone(), e.to_string()));
            }
        }
    }

    report.jurisdictions = jurisdictions;
    Ok(report)
}

// ── Jobs ──

/// Fetch and extract one locator, retrying transient failures.
pub async fn run_job(ctx: &JobContext, locator: RecordLocator) -> JobOutcome {
    let mut job = Job::new(locator);
    let mut attempts = Attempts::new(ctx);

    loop {
        job.begin_attempt();
        ctx.throttle(&job.locator.jurisdiction.url).await;

        let result = match attempts.session() {
            Ok(session) => ctx.adapter.fetch_page(session, &job.locator).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(page) => {
                job.advance(Stage::Fetched);
                let record = ctx.adapter.extract(&page);
                job.advance(Stage::Extracted);
                if let Some(reason) = record.parse_error() {
                    debug!(url = %job.locator.url, %reason, "partial extraction");
                }
                return JobOutcome {
                    job,
                    record,
                    page: Some(page),
                };
            }
            Err(e) => {
                if attempts.retry_after(&e, &job.locator.url).await {
                    job.schedule_retry();
                    continue;
                }
                let reason = e.to_string();
                if e.is_retryable() {
                    job.abandon(Stage::Fetched, &reason);
                } else {
                    job.fail(Stage::Fetched, &reason);
                }
                warn!(url = %job.locator.url, attempts = attempts.made(), error = %reason, "fetch failed");
                return JobOutcome {
                    job,
                    record: CanonicalRecord::failed(reason),
                    page: None,
                };
            }
        }
    }
}

/// Start jobs while permits and the cancel signal allow; returns how many
/// locators were never started.
async fn schedule(
    ctx: Arc<JobContext>,
    queue: Vec<RecordLocator>,
    tx: mpsc::Sender<JobOutcome>,
) -> usize {
    let permits = Arc::new(Semaphore::new(ctx.settings.max_concurrency));
    let total = queue.len();

    for (i, locator) in queue.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            warn!(remaining = total - i, "cancelled; no new jobs scheduled");
            return total - i;
        };

        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = run_job(&ctx, locator).await;
            let _ = tx.send(outcome).await;
            drop(permit);
        });
    }
    0
}

fn persist(store: &mut Store, ctx: &JobContext, mut outcome: JobOutcome, stats: &mut RunStats) -> Result<()> {
    let locator = &outcome.job.locator;
    if ctx.settings.store_raw_pages {
        if let Some(page) = &outcome.page {
            store.save_raw_page(page)?;
        }
    }
    store
        .append(locator, &outcome.record)
        .with_context(|| format!("persisting {}", locator.url))?;
    stats.record(locator, outcome.record.status(), outcome.page.is_some());
    outcome.job.advance(Stage::Persisted);
    debug!(
        url = %outcome.job.locator.url,
        stage = ?outcome.job.stage(),
        status = ?outcome.job.status,
        "job finished"
    );
    Ok(())
}

/// Run every locator not already in the ledger and persist each outcome as
/// it arrives. Always ends with a checkpoint snapshot.
pub async fn harvest(ctx: Arc<JobContext>, store: &mut Store, locators: Vec<RecordLocator>) -> Result<RunStats> {
    let mut stats = RunStats::default();
    let mut scheduled = HashSet::new();
    let mut queue = Vec::new();
    for locator in locators {
        let key = locator.ledger_key();
        if store.contains(&key) || !scheduled.insert(key) {
            stats.entry(&locator.jurisdiction).skipped += 1;
            continue;
        }
        queue.push(locator);
    }

    let skipped = stats.total().skipped;
    info!(jobs = queue.len(), skipped, "harvest starting");

    let pb = progress_bar(queue.len())?;
    let (tx, mut rx) = mpsc::channel::<JobOutcome>(ctx.settings.max_concurrency * 2);
    let scheduler = tokio::spawn(schedule(Arc::clone(&ctx), queue, tx));

    while let Some(outcome) = rx.recv().await {
        if let Err(e) = persist(store, &ctx, outcome, &mut stats) {
            ctx.cancel.cancel();
            pb.abandon();
            return Err(e);
        }
        pb.inc(1);
    }

    let unscheduled = scheduler.await.context("scheduler task")?;
    stats.cancelled |= unscheduled > 0;
    pb.finish_and_clear();

    store.snapshot()?;
    let total = stats.total();
    info!(
        complete = total.complete,
        partial = total.partial,
        failed = total.failed,
        unscheduled,
        "harvest finished"
    );
    Ok(stats)
}

/// Discovery and harvest in one pass over the discovered locator set.
pub async fn run(ctx: Arc<JobContext>, store: &mut Store, seed: &str) -> Result<RunStats> {
    let report = discover(&ctx, store, seed).await?;
    let mut stats = report.stats;
    if ctx.cancel.is_cancelled() {
        store.snapshot()?;
        return Ok(stats);
    }
    stats.merge(harvest(ctx, store, report.locators).await?);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayRange, Settings};
    use crate::model::{Field, Platform, RecordStatus};
    use crate::platforms::adapter_for;
    use crate::session::testing::{Script, ScriptedFactory};
    use crate::session::SessionErrorKind;

    fn fixture(name: &str) -> String {
        let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
        std::fs::read_to_string(path).unwrap()
    }

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.rate_per_minute = 600_000;
        s.politeness_delay_range = DelayRange { min_ms: 0, max_ms: 0 };
        s.base_backoff_ms = 0;
        s.settle_delay_ms = 0;
        s.challenge_poll_ms = 0;
        s.challenge_timeout_iterations = 3;
        s.max_retries = 2;
        s
    }

    fn context(platform: Platform, settings: Settings, script: &Script) -> Arc<JobContext> {
        let adapter = adapter_for(platform, &settings);
        let factory = Arc::new(ScriptedFactory { script: script.clone() });
        Arc::new(JobContext::new(Arc::new(settings), adapter, factory).unwrap())
    }

    fn county() -> Jurisdiction {
        Jurisdiction::from_label(
            Platform::QPublic,
            "Crawford County, AR",
            "https://qpublic.test/Application.aspx?App=CrawfordCountyAR",
        )
    }

    fn record_url(id: &str) -> String {
        format!("https://qpublic.test/Application.aspx?PageTypeID=4&KeyValue={}", id)
    }

    fn locators(ids: &[&str]) -> Vec<RecordLocator> {
        ids.iter().map(|id| RecordLocator::new(&county(), &record_url(id))).collect()
    }

    fn scripted_records(ids: &[&str]) -> Script {
        let script = Script::new();
        let html = fixture("qpublic_record.html");
        for id in ids {
            script.page(&record_url(id), &html);
        }
        script
    }

    #[tokio::test]
    async fn rerun_skips_ledgered_locators() {
        let ids = ["R1", "R2", "R3"];
        let script = scripted_records(&ids);
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let first = harvest(Arc::clone(&ctx), &mut store, locators(&ids)).await.unwrap();
        let t = first.total();
        assert_eq!((t.fetched, t.complete, t.skipped), (3, 3, 0));
        let navigations = script.navigations().len();

        let second = harvest(ctx, &mut store, locators(&ids)).await.unwrap();
        let t = second.total();
        assert_eq!((t.fetched, t.skipped), (0, 3));
        assert_eq!(script.navigations().len(), navigations);
        assert_eq!(store.records().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_locators_in_one_batch_run_once() {
        let script = scripted_records(&["R1"]);
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let stats = harvest(ctx, &mut store, locators(&["R1", "R1"])).await.unwrap();
        assert_eq!(stats.total().skipped, 1);
        assert_eq!(script.navigations_to("KeyValue=R1"), 1);
    }

    #[tokio::test]
    async fn records_behind_the_same_page_name_are_both_fetched() {
        let urls = [
            "https://qpublic.test/Details.aspx?id=1",
            "https://qpublic.test/Details.aspx?id=2",
        ];
        let script = Script::new();
        let html = fixture("qpublic_record.html");
        for url in urls {
            script.page(url, &html);
        }
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let batch = urls.iter().map(|u| RecordLocator::new(&county(), u)).collect();
        let stats = harvest(ctx, &mut store, batch).await.unwrap();
        let t = stats.total();
        assert_eq!((t.fetched, t.skipped), (2, 0));
        assert_eq!(script.navigations_to("Details.aspx?id=1"), 1);
        assert_eq!(script.navigations_to("Details.aspx?id=2"), 1);
        assert_eq!(store.records().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn extracted_fields_reach_the_store() {
        let script = scripted_records(&["R06259-050"]);
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        harvest(ctx, &mut store, locators(&["R06259-050"])).await.unwrap();
        let records = store.records().unwrap();
        let r = &records[0].record;
        assert_eq!(r.parcel_id(), Some("R06259-050"));
        assert_eq!(r.text(Field::LastYearDueAmount), Some("$80.00"));
        assert_eq!(r.text(Field::TotalDueAmount), Some("$200.00"));
        assert_eq!(store.raw_pages(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn crashed_session_is_replaced_before_retry() {
        let script = scripted_records(&["R1"]);
        script.fail_navigation("KeyValue=R1", SessionErrorKind::Crashed);
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let stats = harvest(ctx, &mut store, locators(&["R1"])).await.unwrap();
        assert_eq!(stats.total().complete, 1);
        assert_eq!(script.creations(), 2);
        assert!(store.contains(&locators(&["R1"])[0].ledger_key()));
    }

    #[tokio::test]
    async fn exhausted_retries_persist_a_failed_record() {
        let script = scripted_records(&["R1"]);
        for _ in 0..3 {
            script.fail_navigation("KeyValue=R1", SessionErrorKind::Timeout);
        }
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let stats = harvest(ctx, &mut store, locators(&["R1"])).await.unwrap();
        assert_eq!(stats.total().failed, 1);
        assert_eq!(script.navigations_to("KeyValue=R1"), 3);
        // A timeout does not poison the session.
        assert_eq!(script.creations(), 1);

        let records = store.records().unwrap();
        assert_eq!(records[0].record.status(), RecordStatus::Failed);
        assert_eq!(records[0].record.field_count(), 0);
        assert!(records[0].record.parse_error().unwrap().contains("timeout"));
        assert!(!store.contains(&locators(&["R1"])[0].ledger_key()));
    }

    #[tokio::test]
    async fn rejected_page_is_not_retried() {
        let script = Script::new();
        let ctx = context(Platform::QPublic, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let stats = harvest(ctx, &mut store, locators(&["R404"])).await.unwrap();
        assert_eq!(stats.total().failed, 1);
        assert_eq!(script.navigations_to("KeyValue=R404"), 1);
    }

    #[tokio::test]
    async fn challenge_timeout_forces_fresh_session() {
        let script = scripted_records(&["R1"]);
        script.stuck_on_challenge();
        let mut s = settings();
        s.max_retries = 1;
        let ctx = context(Platform::QPublic, s, &script);
        let mut store = Store::open_in_memory().unwrap();

        let stats = harvest(ctx, &mut store, locators(&["R1"])).await.unwrap();
        assert_eq!(stats.total().failed, 1);
        assert_eq!(script.creations(), 2);
        assert_eq!(script.title_checks(), 6);
    }

    #[tokio::test]
    async fn cancelled_batch_still_leaves_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snap = dir.path().join("checkpoint.json");
        let script = scripted_records(&["R1", "R2"]);
        let ctx = context(Platform::QPublic, settings(), &script);
        ctx.cancel.cancel();
        let mut store = Store::open_in_memory().unwrap().with_snapshots(&snap, 50).unwrap();

        let stats = harvest(ctx, &mut store, locators(&["R1", "R2"])).await.unwrap();
        assert!(stats.cancelled);
        assert!(script.navigations().is_empty());
        assert!(snap.exists());
    }

    #[tokio::test]
    async fn run_discovers_before_harvesting() {
        let script = Script::new();
        script.page(
            "https://www.bid4assets.test/SalesCalendar",
            r#"<html><head><title>Sales Calendar | Bid4Assets</title></head><body>
               <div class="auction-item">
                 <span class="state">CA</span><span class="county">Riverside County</span>
                 <span class="sale-date">10/20/2025</span>
                 <a href="/storefront/Riverside">View</a>
               </div></body></html>"#,
        );
        script.page(
            "https://www.bid4assets.test/storefront/Riverside",
            r#"<html><head><title>Bid4Assets</title></head><body>
               <a href="/Item/9001">a</a><a href="/Item/9002">b</a></body></html>"#,
        );
        let item = fixture("bid4assets_item.html");
        script.page("https://www.bid4assets.test/Item/9001", &item);
        script.page("https://www.bid4assets.test/Item/9002", &item);

        let ctx = context(Platform::Bid4Assets, settings(), &script);
        let mut store = Store::open_in_memory().unwrap();

        let stats = run(Arc::clone(&ctx), &mut store, "https://www.bid4assets.test").await.unwrap();
        let t = stats.total();
        assert_eq!((t.discovered, t.fetched, t.complete), (2, 2, 2));
        assert_eq!(store.jurisdiction_counts().unwrap()[0].complete, 2);

        let again = run(ctx, &mut store, "https://www.bid4assets.test").await.unwrap();
        assert_eq!(again.total().skipped, 2);
        assert_eq!(script.navigations_to("/Item/9001"), 1);
    }
}
