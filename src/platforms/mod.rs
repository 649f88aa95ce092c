//! Platform adapters: how each source exposes its jurisdictions and record
//! pages. The dropdown family (qPublic, Beacon, Tyler) shares one
//! parameterised routine; the auction calendar is its own variant.

pub mod calendar;
pub mod dropdown;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;

use crate::config::Settings;
use crate::extract;
use crate::model::{CanonicalRecord, Family, Jurisdiction, Platform, RawPage, RecordLocator};
use crate::session::{AutomationSession, FetchError, ObstacleProfile};

pub use calendar::CalendarAdapter;
pub use dropdown::DropdownAdapter;

const CHALLENGE_TITLES: &[&str] = &["just a moment", "attention required"];
const MODAL_SELECTOR: &str = "[class*='btn btn-primary button-1']";

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn obstacles(&self) -> &ObstacleProfile;

    /// Every jurisdiction reachable from `seed`. Not resumable: on failure
    /// the caller re-runs discovery from the start.
    async fn discover_jurisdictions(
        &self,
        session: &mut AutomationSession,
        seed: &str,
    ) -> Result<Vec<Jurisdiction>, FetchError>;

    /// Every record locator inside one jurisdiction.
    async fn discover_locators(
        &self,
        session: &mut AutomationSession,
        jurisdiction: &Jurisdiction,
    ) -> Result<Vec<RecordLocator>, FetchError>;

    /// Load a record page with both obstacles cleared, whatever the platform.
    async fn fetch_page(
        &self,
        session: &mut AutomationSession,
        locator: &RecordLocator,
    ) -> Result<RawPage, FetchError> {
        let status = session.open_clear(&locator.url, self.obstacles()).await?;
        let html = session.page_source().await?;
        Ok(RawPage {
            locator: locator.clone(),
            html,
            fetched_at: Utc::now(),
            status,
        })
    }

    fn extract(&self, page: &RawPage) -> CanonicalRecord {
        extract::extract(self.platform(), &page.html)
    }
}

pub fn obstacle_profile(platform: Platform, settings: &Settings) -> ObstacleProfile {
    let ready_titles = match platform {
        Platform::QPublic => vec!["qpublic"],
        Platform::Beacon => vec!["beacon", "schneider"],
        Platform::Bid4Assets => vec!["bid4assets"],
        // Tyler deployments are branded per county.
        Platform::Tyler => Vec::new(),
    };
    ObstacleProfile {
        ready_titles,
        challenge_titles: CHALLENGE_TITLES.to_vec(),
        modal_selector: MODAL_SELECTOR,
        max_iterations: settings.challenge_timeout_iterations,
        poll: Duration::from_millis(settings.challenge_poll_ms),
    }
}

pub fn adapter_for(platform: Platform, settings: &Settings) -> Arc<dyn PlatformAdapter> {
    let obstacles = obstacle_profile(platform, settings);
    match platform.family() {
        Family::DropdownSearch => Arc::new(DropdownAdapter::new(platform, obstacles)),
        Family::CalendarAuction => Arc::new(CalendarAdapter::new(platform, obstacles, settings.page_ceiling)),
    }
}

/// Resolve `href` against the page it was found on.
pub(crate) fn absolute(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

/// Append `url` unless already present; keeps first-seen order.
pub(crate) fn push_unique(urls: &mut Vec<String>, url: String) -> bool {
    if urls.contains(&url) {
        false
    } else {
        urls.push(url);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hrefs_resolve_against_page() {
        let base = "https://qpublic.schneidercorp.com/Application.aspx?App=X";
        assert_eq!(
            absolute(base, "Application.aspx?KeyValue=1").as_deref(),
            Some("https://qpublic.schneidercorp.com/Application.aspx?KeyValue=1")
        );
        assert_eq!(absolute(base, "javascript:void(0)"), None);
        assert_eq!(absolute(base, "#top"), None);
    }

    #[test]
    fn every_platform_gets_an_adapter() {
        let settings = Settings::default();
        for p in Platform::ALL {
            let adapter = adapter_for(p, &settings);
            assert_eq!(adapter.platform(), p);
            assert_eq!(adapter.obstacles().max_iterations, settings.challenge_timeout_iterations);
        }
    }
}
