//! County office directory pages: keyword categorisation of office names and
//! parsing of the state/county listing pages.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde::Serialize;
use tracing::debug;

use crate::session::dom::normalized_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Assessor,
    Tax,
    Gis,
    Recorder,
    Taxation,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Assessor,
        Category::Tax,
        Category::Gis,
        Category::Recorder,
        Category::Taxation,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Assessor => "assessor",
            Category::Tax => "tax",
            Category::Gis => "gis",
            Category::Recorder => "recorder",
            Category::Taxation => "taxation",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checked in order; the first category with a matching keyword wins.
const KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Assessor, &["property appraiser", "assessor", "apprais"]),
    (Category::Tax, &["tax collector", "treasurer", "tax"]),
    (Category::Gis, &["gis", "mapping", "map"]),
    (Category::Recorder, &["clerk", "recorder", "deed", "register"]),
    (Category::Taxation, &["board of taxation"]),
];

pub fn categorize(label: &str) -> Category {
    let label = label.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| label.contains(w)))
        .map(|(category, _)| *category)
        .unwrap_or(Category::Other)
}

/// One URL per category, first seen wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OfficeDirectory {
    offices: BTreeMap<Category, String>,
}

impl OfficeDirectory {
    /// Returns false when the category was already filled and `url` was dropped.
    pub fn insert(&mut self, label: &str, url: &str) -> bool {
        let category = categorize(label);
        if let Some(kept) = self.offices.get(&category) {
            debug!(%category, office = label, %kept, dropped = url, "duplicate office category");
            return false;
        }
        self.offices.insert(category, url.to_string());
        true
    }

    pub fn get(&self, category: Category) -> Option<&str> {
        self.offices.get(&category).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.offices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &str)> {
        self.offices.iter().map(|(c, u)| (*c, u.as_str()))
    }
}

// ── Directory pages ──

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.div-table").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.div-table-row").unwrap());
static COL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.div-table-col").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

const HEADER_LABELS: &[&str] = &["Name", "Products available"];

/// Office rows of a county page. A page without the table yields an empty directory.
pub fn parse_county_offices(html: &str) -> OfficeDirectory {
    let doc = Html::parse_document(html);
    let mut directory = OfficeDirectory::default();
    let Some(table) = doc.select(&TABLE).next() else {
        return directory;
    };
    for row in table.select(&ROW) {
        let cols: Vec<_> = row.select(&COL).collect();
        if cols.len() < 2 {
            continue;
        }
        let name = normalized_text(cols[0]);
        if HEADER_LABELS.contains(&name.as_str()) {
            continue;
        }
        let url = row
            .select(&LINK)
            .filter_map(|a| a.value().attr("href"))
            .find(|h| h.starts_with("http"));
        if let Some(url) = url {
            directory.insert(&name, url);
        }
    }
    directory
}

/// County slugs linked from a state page (`.../county/<slug>`), first-seen order.
pub fn parse_county_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut counties: Vec<String> = Vec::new();
    for href in doc.select(&LINK).filter_map(|a| a.value().attr("href")) {
        let Some((_, slug)) = href.rsplit_once("/county/") else {
            continue;
        };
        let slug = slug.trim_end_matches('/');
        if !slug.is_empty() && !counties.iter().any(|c| c == slug) {
            counties.push(slug.to_string());
        }
    }
    counties
}

const STATE_KEYS: &[(&str, &str)] = &[
    ("AL", "alabama"),
    ("AK", "alaska"),
    ("AZ", "arizona"),
    ("AR", "arkansas"),
    ("CA", "california"),
    ("CO", "colorado"),
    ("CT", "connecticut"),
    ("DE", "delaware"),
    ("FL", "fl_"),
    ("GA", "georgia"),
    ("HI", "hawaii"),
    ("ID", "idaho"),
    ("IL", "illinois"),
    ("IN", "indiana"),
    ("IA", "iowa"),
    ("KS", "kansas"),
    ("KY", "kentucky"),
    ("LA", "louisiana"),
    ("ME", "maine"),
    ("MD", "maryland"),
    ("MA", "massachusetts"),
    ("MI", "michigan"),
    ("MN", "minnesota"),
    ("MS", "mississippi"),
    ("MO", "missouri"),
    ("MT", "montana"),
    ("NE", "nebraska"),
    ("NV", "nevada"),
    ("NH", "new_hampshire"),
    ("NJ", "new_jersey"),
    ("NM", "new_mexico"),
    ("NY", "new_york"),
    ("NC", "north_carolina"),
    ("ND", "north_dakota"),
    ("OH", "ohio"),
    ("OK", "oklahoma"),
    ("OR", "oregon"),
    ("PA", "pennsylvania"),
    ("RI", "rhode_island"),
    ("SC", "south_carolina"),
    ("SD", "south_dakota"),
    ("TN", "tennessee"),
    ("TX", "texas"),
    ("UT", "utah"),
    ("VT", "vermont"),
    ("VA", "virginia"),
    ("WA", "washington"),
    ("WV", "west_virginia"),
    ("WI", "wisconsin"),
    ("WY", "wyoming"),
];

/// All two-letter codes the directory knows, in listing order.
pub fn state_codes() -> impl Iterator<Item = &'static str> {
    STATE_KEYS.iter().map(|(code, _)| *code)
}

/// Legacy state key for a two-letter code; unknown codes become `<code>_`.
pub fn state_key(code: &str) -> String {
    let upper = code.to_uppercase();
    STATE_KEYS
        .iter()
        .find(|(c, _)| *c == upper)
        .map(|(_, key)| key.to_string())
        .unwrap_or_else(|| format!("{}_", code.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assessor_keywords_beat_tax() {
        assert_eq!(categorize("Property Appraiser / Tax Assessor"), Category::Assessor);
        assert_eq!(categorize("Tax Collector"), Category::Tax);
        assert_eq!(categorize("County Treasurer"), Category::Tax);
        assert_eq!(categorize("GIS Mapping"), Category::Gis);
        assert_eq!(categorize("Register of Deeds"), Category::Recorder);
        assert_eq!(categorize("Sheriff"), Category::Other);
    }

    #[test]
    fn board_of_taxation_falls_under_tax() {
        // "tax" is checked first, so the dedicated category never fires.
        assert_eq!(categorize("Board of Taxation"), Category::Tax);
    }

    #[test]
    fn first_office_per_category_is_kept() {
        let mut dir = OfficeDirectory::default();
        assert!(dir.insert("County Clerk", "https://clerk.example"));
        assert!(!dir.insert("Register of Deeds", "https://deeds.example"));
        assert_eq!(dir.get(Category::Recorder), Some("https://clerk.example"));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn county_page_rows_are_parsed() {
        let html = r#"<div class="div-table">
            <div class="div-table-row"><div class="div-table-col">Name</div><div class="div-table-col">Products available</div></div>
            <div class="div-table-row"><div class="div-table-col">Property Appraiser</div><div class="div-table-col"><a href="https://pa.example">Go</a></div></div>
            <div class="div-table-row"><div class="div-table-col">Tax Collector</div><div class="div-table-col"><a href="/internal">x</a><a href="https://tc.example">Go</a></div></div>
            <div class="div-table-row"><div class="div-table-col">Clerk of Court</div><div class="div-table-col"><a href="/nolink">x</a></div></div>
            <div class="div-table-row"><div class="div-table-col">Only one column</div></div>
        </div>"#;
        let dir = parse_county_offices(html);
        assert_eq!(dir.get(Category::Assessor), Some("https://pa.example"));
        assert_eq!(dir.get(Category::Tax), Some("https://tc.example"));
        assert_eq!(dir.get(Category::Recorder), None);
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn missing_table_gives_empty_directory() {
        assert!(parse_county_offices("<html><body>maintenance</body></html>").is_empty());
    }

    #[test]
    fn county_links_are_deduplicated() {
        let html = r#"<a href="/state/FL/county/alachua">Alachua</a>
            <a href="/state/FL/county/baker/">Baker</a>
            <a href="/state/FL/county/alachua">Alachua again</a>
            <a href="/about">About</a>"#;
        assert_eq!(parse_county_links(html), vec!["alachua", "baker"]);
    }

    #[test]
    fn state_keys_follow_legacy_names() {
        assert_eq!(state_key("FL"), "fl_");
        assert_eq!(state_key("ny"), "new_york");
        assert_eq!(state_key("PR"), "pr_");
    }
}
