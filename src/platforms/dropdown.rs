use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{absolute, push_unique, PlatformAdapter};
use crate::model::{Jurisdiction, Platform, RecordLocator};
use crate::session::{AbsentOk, AutomationSession, Element, FetchError, ObstacleProfile, SessionError};

// ── County picker ──

const MENU_BUTTON: &str = "#areaMenuButton";
const STATE_GROUP: &str = ".state-group";
const OPTION: &str = ".dropdown-option";
const OPTION_LINK: &str = "a[href]";
/// Pseudo-entry listing recently used counties; never a real jurisdiction.
const MRU: &str = "mru-group";
const MRU_LINK: &str = ".track-mru";

/// Owner-name search repeated for every initial, for sites without a "show all".
#[derive(Debug)]
pub struct OwnerSweep {
    pub input: &'static str,
    pub submit: &'static [&'static str],
    pub results: &'static str,
}

/// Selectors that differ between deployments of the dropdown family.
#[derive(Debug)]
pub struct DropdownProfile {
    pub search_tabs: &'static [&'static str],
    pub search_buttons: &'static [&'static str],
    pub parcel_links: &'static [&'static str],
    /// Plain county links tried when the picker yields nothing.
    pub county_links: Option<&'static str>,
    pub owner_sweep: Option<OwnerSweep>,
}

const SCHNEIDER: DropdownProfile = DropdownProfile {
    search_tabs: &[
        "[class*='tt-upm-address-search-btn']",
        "[id*='btnAddressSearch']",
        "[class*='search-button']",
    ],
    search_buttons: &["[id*='_ctl01_btnSearch']"],
    parcel_links: &["[id*='_lnkParcelID']", "[class*='parcel-link']", "a[href*='parcel']"],
    county_links: None,
    owner_sweep: None,
};

const TYLER_SUBMIT: &[&str] = &[
    "input[type='submit'][value*='Search']",
    "input[id*='btnSearch']",
    "button[type='submit']",
];

const TYLER: DropdownProfile = DropdownProfile {
    search_tabs: &[],
    search_buttons: TYLER_SUBMIT,
    parcel_links: &["a[href*='ParcelID']"],
    county_links: Some("a[href*='County']"),
    owner_sweep: Some(OwnerSweep {
        input: "input[name*='Owner']",
        submit: TYLER_SUBMIT,
        results: "a[href*='ParcelID']",
    }),
};

pub fn profile_for(platform: Platform) -> &'static DropdownProfile {
    match platform {
        Platform::Tyler => &TYLER,
        _ => &SCHNEIDER,
    }
}

pub struct DropdownAdapter {
    platform: Platform,
    obstacles: ObstacleProfile,
    profile: &'static DropdownProfile,
}

impl DropdownAdapter {
    pub fn new(platform: Platform, obstacles: ObstacleProfile) -> Self {
        DropdownAdapter {
            platform,
            obstacles,
            profile: profile_for(platform),
        }
    }

    /// Walk the picker: every option of every state group except the MRU entries.
    async fn menu_jurisdictions(&self, session: &mut AutomationSession) -> Result<Vec<Jurisdiction>, SessionError> {
        let Some(menu) = session.find_one(MENU_BUTTON).await.absent_ok()? else {
            debug!(platform = %self.platform, "no county picker on page");
            return Ok(Vec::new());
        };
        let page = session.current_url().await?;

        let mut found = Vec::new();
        let mut seen = Vec::new();
        for group in session.find_all(STATE_GROUP).await? {
            if group.attr("aria-labelledby") == Some(MRU) {
                continue;
            }
            for option in session.find_within(&group, OPTION).await? {
                if option.id() == Some(MRU) {
                    continue;
                }
                let Some((label, url)) = self.option_target(session, &menu, &option, &page).await? else {
                    debug!(option = %option.text, "option without a target");
                    continue;
                };
                if push_unique(&mut seen, url.clone()) {
                    found.push(Jurisdiction::from_label(self.platform, &label, &url));
                }
            }
        }
        Ok(found)
    }

    /// Label and entry URL for one picker option.
    async fn option_target(
        &self,
        session: &mut AutomationSession,
        menu: &Element,
        option: &Element,
        page: &str,
    ) -> Result<Option<(String, String)>, SessionError> {
        let href = match option.href() {
            Some(h) => Some(h.to_string()),
            None => session
                .find_within(option, OPTION_LINK)
                .await?
                .into_iter()
                .find_map(|a| a.href().map(str::to_string)),
        };
        if let Some(url) = href.and_then(|h| absolute(page, &h)) {
            return Ok((!option.text.is_empty()).then(|| (option.text.clone(), url)));
        }

        // Script-driven picker: choose the option, then read back the label and link.
        session.click(menu).await?;
        session.click(option).await?;
        let label = match session.find_one(MENU_BUTTON).await.absent_ok()? {
            Some(m) if !m.text.is_empty() => m.text,
            _ => option.text.clone(),
        };
        let link = session.find_one(MRU_LINK).await.absent_ok()?;
        Ok(link
            .and_then(|l| l.href().and_then(|h| absolute(page, h)))
            .map(|url| (label, url)))
    }

    async fn linked_jurisdictions(
        &self,
        session: &mut AutomationSession,
        selector: &str,
    ) -> Result<Vec<Jurisdiction>, SessionError> {
        let page = session.current_url().await?;
        let mut seen = Vec::new();
        let mut found = Vec::new();
        for link in session.find_all(selector).await? {
            if link.text.is_empty() {
                continue;
            }
            let Some(url) = link.href().and_then(|h| absolute(&page, h)) else {
                continue;
            };
            if push_unique(&mut seen, url.clone()) {
                found.push(Jurisdiction::from_label(self.platform, &link.text, &url));
            }
        }
        Ok(found)
    }

    /// Hrefs of the first selector that matches anything.
    async fn collect_links(
        &self,
        session: &mut AutomationSession,
        selectors: &[&str],
    ) -> Result<Vec<String>, SessionError> {
        let page = session.current_url().await?;
        for selector in selectors {
            let mut urls = Vec::new();
            for el in session.find_all(selector).await? {
                if let Some(url) = el.href().and_then(|h| absolute(&page, h)) {
                    push_unique(&mut urls, url);
                }
            }
            if !urls.is_empty() {
                return Ok(urls);
            }
        }
        Ok(Vec::new())
    }

    /// Unfiltered search: open the search tab, run it empty, read the result links.
    async fn show_all(&self, session: &mut AutomationSession) -> Result<Vec<String>, FetchError> {
        if let Some(tab) = session.click_first_of(self.profile.search_tabs).await? {
            debug!(tab, "opened search tab");
        }
        if session.click_first_of(self.profile.search_buttons).await?.is_none() {
            debug!("no search button, reading links on the landing page");
        }
        session.dismiss_modal(&self.obstacles).await?;
        Ok(self.collect_links(session, self.profile.parcel_links).await?)
    }

    async fn sweep_owners(
        &self,
        session: &mut AutomationSession,
        jurisdiction: &Jurisdiction,
        sweep: &OwnerSweep,
    ) -> Result<Vec<String>, FetchError> {
        let mut urls = Vec::new();
        for (i, letter) in ('A'..='Z').enumerate() {
            if i > 0 {
                session.open_clear(&jurisdiction.url, &self.obstacles).await?;
            }
            let Some(input) = session.find_one(sweep.input).await.absent_ok()? else {
                warn!(county = %jurisdiction.label(), "owner search input missing");
                break;
            };
            session.type_text(&input, &format!("{}*", letter)).await?;
            if session.click_first_of(sweep.submit).await?.is_none() {
                warn!(county = %jurisdiction.label(), "owner search has no submit control");
                break;
            }
            session.dismiss_modal(&self.obstacles).await?;

            let before = urls.len();
            for url in self.collect_links(session, &[sweep.results]).await? {
                push_unique(&mut urls, url);
            }
            debug!(%letter, added = urls.len() - before, "owner sweep");
        }
        Ok(urls)
    }
}

#[async_trait]
impl PlatformAdapter for DropdownAdapter {
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
        session.open_clear(seed, &self.obstacles).await?;

        let mut found = self.menu_jurisdictions(session).await?;
        if found.is_empty() {
            if let Some(selector) = self.profile.county_links {
                found = self.linked_jurisdictions(session, selector).await?;
            }
        }
        if found.is_empty() {
            info!(platform = %self.platform, seed, "no county list, treating seed as the only jurisdiction");
            found.push(Jurisdiction::from_seed(self.platform, seed));
        }

        info!(platform = %self.platform, count = found.len(), "jurisdictions discovered");
        Ok(found)
    }

    async fn discover_locators(
        &self,
        session: &mut AutomationSession,
        jurisdiction: &Jurisdiction,
    ) -> Result<Vec<RecordLocator>, FetchError> {
        session.open_clear(&jurisdiction.url, &self.obstacles).await?;

        let urls = match &self.profile.owner_sweep {
            Some(sweep) => self.sweep_owners(session, jurisdiction, sweep).await?,
            None => self.show_all(session).await?,
        };
        if urls.is_empty() {
            return Err(SessionError::not_found(format!("no record links for {}", jurisdiction.label())).into());
        }

        info!(county = %jurisdiction.label(), count = urls.len(), "locators discovered");
        Ok(urls.iter().map(|u| RecordLocator::new(jurisdiction, u)).collect())
    }
}
