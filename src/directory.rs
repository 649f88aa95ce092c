//! County office directory harvest from the NETR public-records index.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract::offices::{parse_county_links, parse_county_offices, state_key, Category};
use crate::session::AutomationSession;
use crate::store::Store;

pub const DIRECTORY_BASE: &str = "https://publicrecords.netronline.com";

#[derive(Debug, Default)]
pub struct DirectorySummary {
    pub counties: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub urls: usize,
    pub by_category: BTreeMap<Category, usize>,
}

impl DirectorySummary {
    pub fn print(&self) {
        println!("Total counties: {}", self.counties);
        println!("Successful:     {}", self.succeeded);
        println!("Failed:         {}", self.failed);
        println!("URLs extracted: {}", self.urls);
        for (category, n) in &self.by_category {
            println!("  {:<10} {}", category.as_str(), n);
        }
        if self.counties > 0 {
            println!(
                "Success rate:   {:.1}%",
                self.succeeded as f64 / self.counties as f64 * 100.0
            );
        }
    }
}

pub struct DirectoryHarvest<'a> {
    pub base: String,
    pub delay: RangeInclusive<Duration>,
    pub limit_per_state: Option<usize>,
    pub cancel: &'a CancellationToken,
}

fn pause(range: &RangeInclusive<Duration>) -> Duration {
    let (lo, hi) = (range.start().as_millis() as u64, range.end().as_millis() as u64);
    if hi == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

impl DirectoryHarvest<'_> {
    async fn fetch(&self, session: &mut AutomationSession, url: &str) -> Result<String> {
        session.open(url).await?;
        Ok(session.page_source().await?)
    }

    /// Walk each state's county list and store one office row per county.
    pub async fn run(
        &self,
        session: &mut AutomationSession,
        store: &Store,
        states: &[String],
    ) -> Result<DirectorySummary> {
        let mut summary = DirectorySummary::default();

        for (i, code) in states.iter().enumerate() {
            let code = code.to_uppercase();
            let state_url = format!("{}/state/{}", self.base, code);
            info!(state = %code, "[{}/{}] listing counties", i + 1, states.len());

            let mut counties = match self.fetch(session, &state_url).await {
                Ok(html) => parse_county_links(&html),
                Err(e) => {
                    warn!(state = %code, error = %e, "failed to list counties");
                    continue;
                }
            };
            if let Some(limit) = self.limit_per_state {
                counties.truncate(limit);
            }
            info!(state = %code, count = counties.len(), "counties found");

            let key = state_key(&code);
            for county in &counties {
                if self.cancel.is_cancelled() {
                    warn!("cancelled; directory harvest stopped");
                    return Ok(summary);
                }
                summary.counties += 1;
                let url = format!("{}/county/{}", state_url, county);
                match self.fetch(session, &url).await {
                    Ok(html) => {
                        let offices = parse_county_offices(&html);
                        store.save_offices(&key, &county.to_lowercase(), &offices)?;
                        summary.succeeded += 1;
                        summary.urls += offices.len();
                        for (category, _) in offices.iter() {
                            *summary.by_category.entry(category).or_default() += 1;
                        }
                        debug!(county = %county, urls = offices.len(), "county offices");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(county = %county, error = %e, "county page failed");
                    }
                }

                let wait = pause(&self.delay);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Ok(summary)
    }
}
