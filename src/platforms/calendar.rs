use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use super::{absolute, push_unique, PlatformAdapter};
use crate::model::{Jurisdiction, Platform, RecordLocator};
use crate::session::dom::normalized_text;
use crate::session::{AbsentOk, AutomationSession, FetchError, ObstacleProfile};

const CALENDAR_PATH: &str = "/SalesCalendar";
const ITEM_LINK: &str = "a[href*='/Item/']";
const NEXT_LINK: &str = "a[aria-label='Next']";

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)auction-item|sale-item").unwrap());
static STATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bstate\b").unwrap());
static COUNTY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)county|jurisdiction").unwrap());
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)date").unwrap());
static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\btype\b|sale-type").unwrap());
static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bcount\b|properties").unwrap());
static CLASSED: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[class]").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// One upcoming sale listed on the auction calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub state: String,
    pub county: String,
    pub date: String,
    pub auction_type: String,
    pub url: Option<String>,
    pub property_count: u32,
}

fn classed<'a>(scope: ElementRef<'a>, re: &Regex) -> Option<ElementRef<'a>> {
    scope.select(&CLASSED).find(|el| {
        el.value()
            .attr("class")
            .map(|c| re.is_match(c))
            .unwrap_or(false)
    })
}

/// Entries that name at least a state, a county and a date.
pub fn parse_calendar(html: &str, base: &str) -> Vec<CalendarEntry> {
    let doc = Html::parse_document(html);
    let mut entries = Vec::new();
    for item in doc.select(&CLASSED) {
        let is_entry = item
            .value()
            .attr("class")
            .map(|c| ENTRY_RE.is_match(c))
            .unwrap_or(false);
        if !is_entry {
            continue;
        }
        let text = |re: &Regex| classed(item, re).map(normalized_text).filter(|t| !t.is_empty());
        let (Some(state), Some(county), Some(date)) = (text(&*STATE_RE), text(&*COUNTY_RE), text(&*DATE_RE)) else {
            debug!("calendar entry without state, county or date");
            continue;
        };
        let url = item
            .select(&LINK)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|h| absolute(base, h));
        let property_count = text(&*COUNT_RE)
            .and_then(|t| t.chars().filter(char::is_ascii_digit).collect::<String>().parse().ok())
            .unwrap_or(0);
        entries.push(CalendarEntry {
            state,
            county,
            date,
            auction_type: text(&*TYPE_RE).unwrap_or_else(|| "unknown".into()),
            url,
            property_count,
        });
    }
    entries
}

pub struct CalendarAdapter {
    platform: Platform,
    obstacles: ObstacleProfile,
    page_ceiling: u32,
}

impl CalendarAdapter {
    pub fn new(platform: Platform, obstacles: ObstacleProfile, page_ceiling: u32) -> Self {
        CalendarAdapter {
            platform,
            obstacles,
            page_ceiling,
        }
    }
}

#[async_trait]
impl PlatformAdapter for CalendarAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn obstacles(&self) -> &ObstacleProfile {
        &self.obstacles
    }

    async fn discover_jurisdictions(
        &self,
        session: &mut AutomationSession,
        seed: &str,
    ) -> Result<Vec<Jurisdiction>, FetchError> {
        let calendar = Url::parse(seed)
            .and_then(|u| u.join(CALENDAR_PATH))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{}{}", seed.trim_end_matches('/'), CALENDAR_PATH));
        session.open_clear(&calendar, &self.obstacles).await?;
        let html = session.page_source().await?;

        let mut seen = Vec::new();
        let mut found = Vec::new();
        for entry in parse_calendar(&html, &calendar) {
            let Some(url) = entry.url else {
                warn!(state = %entry.state, county = %entry.county, "calendar entry without a link");
                continue;
            };
            info!(
                state = %entry.state,
                county = %entry.county,
                date = %entry.date,
                kind = %entry.auction_type,
                properties = entry.property_count,
                "auction found"
            );
            if push_unique(&mut seen, url.clone()) {
                found.push(Jurisdiction {
                    platform: self.platform,
                    state: entry.state,
                    county: entry.county,
                    url,
                });
            }
        }
        if found.is_empty() {
            warn!(%calendar, "auction calendar lists no sales");
        }
        Ok(found)
    }

    /// Item links across result pages, following "Next" at most `page_ceiling` pages deep.
    async fn discover_locators(
        &self,
        session: &mut AutomationSession,
        jurisdiction: &Jurisdiction,
    ) -> Result<Vec<RecordLocator>, FetchError> {
        session.open_clear(&jurisdiction.url, &self.obstacles).await?;

        let mut urls = Vec::new();
        for page in 1..=self.page_ceiling {
            let current = session.current_url().await?;
            let before = urls.len();
            for link in session.find_all(ITEM_LINK).await? {
                if let Some(url) = link.href().and_then(|h| absolute(&current, h)) {
                    push_unique(&mut urls, url);
                }
            }
            debug!(page, added = urls.len() - before, "auction page read");

            if page == self.page_ceiling {
                warn!(county = %jurisdiction.label(), ceiling = self.page_ceiling, "page ceiling reached");
                break;
            }
            let Some(next) = session.find_one(NEXT_LINK).await.absent_ok()? else {
                break;
            };
            session.click(&next).await?;
            session.clear_obstacles(&self.obstacles).await?;
        }

        info!(county = %jurisdiction.label(), count = urls.len(), "locators discovered");
        Ok(urls.iter().map(|u| RecordLocator::new(jurisdiction, u)).collect())
    }
}
