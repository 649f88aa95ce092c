use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigError;

const MIN_URL_ID_LEN: usize = 3;
const MAX_PARCEL_ID_LEN: usize = 100;
const ID_QUERY_KEYS: &[&str] = &["keyvalue", "parcelid", "parcel", "itemid"];

// ── Platforms ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    QPublic,
    Beacon,
    Tyler,
    Bid4Assets,
}

/// Navigation family a platform belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    DropdownSearch,
    CalendarAuction,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::QPublic,
        Platform::Beacon,
        Platform::Tyler,
        Platform::Bid4Assets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::QPublic => "qpublic",
            Platform::Beacon => "beacon",
            Platform::Tyler => "tyler",
            Platform::Bid4Assets => "bid4assets",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Platform::Bid4Assets => Family::CalendarAuction,
            _ => Family::DropdownSearch,
        }
    }

    /// Entry URL used when no seed is given on the command line.
    pub fn default_seed(&self) -> Option<&'static str> {
        match self {
            Platform::QPublic => Some("https://qpublic.schneidercorp.com"),
            Platform::Beacon => Some("https://beacon.schneidercorp.com"),
            Platform::Bid4Assets => Some("https://www.bid4assets.com"),
            Platform::Tyler => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownPlatform(s.to_string()))
    }
}

// ── Jurisdictions and locators ──

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub platform: Platform,
    pub state: String,
    pub county: String,
    /// Entry page for this county on the platform.
    pub url: String,
}

impl Jurisdiction {
    /// Build from a dropdown label such as "Crawford County, AR".
    pub fn from_label(platform: Platform, label: &str, url: &str) -> Self {
        let label = label.trim();
        let (county, state) = match label.rsplit_once(',') {
            Some((county, state)) => (county.trim(), state.trim()),
            None => (label, ""),
        };
        Jurisdiction {
            platform,
            state: state.to_string(),
            county: county.to_string(),
            url: url.to_string(),
        }
    }

    /// Single-scope jurisdiction for deployments without a county picker.
    pub fn from_seed(platform: Platform, seed: &str) -> Self {
        let county = Url::parse(seed)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_else(|| seed.to_string());
        Jurisdiction {
            platform,
            state: String::new(),
            county,
            url: seed.to_string(),
        }
    }

    pub fn label(&self) -> String {
        if self.state.is_empty() {
            self.county.clone()
        } else {
            format!("{}, {}", self.county, self.state)
        }
    }
}

/// Identity used by the dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub platform: Platform,
    pub parcel_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocator {
    pub platform: Platform,
    pub jurisdiction: Jurisdiction,
    pub url: String,
    pub parcel_id: Option<String>,
}

impl RecordLocator {
    pub fn new(jurisdiction: &Jurisdiction, url: &str) -> Self {
        RecordLocator {
            platform: jurisdiction.platform,
            jurisdiction: jurisdiction.clone(),
            url: url.to_string(),
            parcel_id: parcel_id_from_url(url),
        }
    }

    /// Deterministic key: the URL-derived parcel id, else a hash of the URL.
    pub fn parcel_key(&self) -> String {
        match &self.parcel_id {
            Some(id) => id.clone(),
            None => url_hash_key(&self.url),
        }
    }

    /// Hash-derived keys carry no identity guarantee across distinct URLs.
    pub fn is_hash_keyed(&self) -> bool {
        self.parcel_id.is_none()
    }

    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey {
            platform: self.platform,
            parcel_key: self.parcel_key(),
        }
    }
}

/// Pull a parcel identifier out of a record URL, if it carries one.
pub fn parcel_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;

    let from_query = parsed.query_pairs().find_map(|(k, v)| {
        let key = k.to_lowercase();
        ID_QUERY_KEYS.contains(&key.as_str()).then(|| v.into_owned())
    });

    // A trailing segment only identifies the record when nothing else in the
    // URL varies; `Details.aspx?id=1` and `?id=2` share it.
    let raw = from_query.or_else(|| {
        if parsed.query().is_some_and(|q| !q.is_empty()) {
            return None;
        }
        parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .filter(|s| !s.contains('.'))
            .map(|s| s.to_string())
    })?;

    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.chars().count() < MIN_URL_ID_LEN {
        return None;
    }
    Some(cleaned.chars().take(MAX_PARCEL_ID_LEN).collect())
}

fn url_hash_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("url-{}", hex)
}

// ── Raw pages ──

#[derive(Debug, Clone)]
pub struct RawPage {
    pub locator: RecordLocator,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
}

impl RawPage {
    pub fn fetch_date(&self) -> NaiveDate {
        self.fetched_at.date_naive()
    }
}

// ── Canonical records ──

/// Canonical fields in export order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ParcelId,
    Owner,
    SiteAddress,
    MailingAddress,
    LegalDescription,
    PropertyType,
    LandValue,
    ImprovementValue,
    AssessedValue,
    MarketValue,
    BuildingSqft,
    YearBuilt,
    Bedrooms,
    Bathrooms,
    LotSize,
    Zoning,
    TaxYear,
    TaxAmountDue,
    LastSaleDate,
    LastSalePrice,
    Exemptions,
    ImageUrls,
    MapUrl,
    ParseError,
    PropertyTaxAccount,
    CurrentDueAmount,
    LastYearDueAmount,
    TotalDueAmount,
    DeedBook,
    DeedPage,
    TaxStatus,
    AuctionType,
    OpeningBid,
    CurrentBid,
    AuctionEndTime,
    RedemptionPeriod,
    DocumentUrls,
    PropertyTitle,
    NumberOfBids,
    Seller,
    Notes,
}

impl Field {
    pub const ALL: [Field; 41] = [
        Field::ParcelId,
        Field::Owner,
        Field::SiteAddress,
        Field::MailingAddress,
        Field::LegalDescription,
        Field::PropertyType,
        Field::LandValue,
        Field::ImprovementValue,
        Field::AssessedValue,
        Field::MarketValue,
        Field::BuildingSqft,
        Field::YearBuilt,
        Field::Bedrooms,
        Field::Bathrooms,
        Field::LotSize,
        Field::Zoning,
        Field::TaxYear,
        Field::TaxAmountDue,
        Field::LastSaleDate,
        Field::LastSalePrice,
        Field::Exemptions,
        Field::ImageUrls,
        Field::MapUrl,
        Field::ParseError,
        Field::PropertyTaxAccount,
        Field::CurrentDueAmount,
        Field::LastYearDueAmount,
        Field::TotalDueAmount,
        Field::DeedBook,
        Field::DeedPage,
        Field::TaxStatus,
        Field::AuctionType,
        Field::OpeningBid,
        Field::CurrentBid,
        Field::AuctionEndTime,
        Field::RedemptionPeriod,
        Field::DocumentUrls,
        Field::PropertyTitle,
        Field::NumberOfBids,
        Field::Seller,
        Field::Notes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::ParcelId => "parcel_id",
            Field::Owner => "owner",
            Field::SiteAddress => "site_address",
            Field::MailingAddress => "mailing_address",
            Field::LegalDescription => "legal_description",
            Field::PropertyType => "property_type",
            Field::LandValue => "land_value",
            Field::ImprovementValue => "improvement_value",
            Field::AssessedValue => "assessed_value",
            Field::MarketValue => "market_value",
            Field::BuildingSqft => "building_sqft",
            Field::YearBuilt => "year_built",
            Field::Bedrooms => "bedrooms",
            Field::Bathrooms => "bathrooms",
            Field::LotSize => "lot_size",
            Field::Zoning => "zoning",
            Field::TaxYear => "tax_year",
            Field::TaxAmountDue => "tax_amount_due",
            Field::LastSaleDate => "last_sale_date",
            Field::LastSalePrice => "last_sale_price",
            Field::Exemptions => "exemptions",
            Field::ImageUrls => "image_urls",
            Field::MapUrl => "map_url",
            Field::ParseError => "parse_error",
            Field::PropertyTaxAccount => "property_tax_account",
            Field::CurrentDueAmount => "current_due_amount",
            Field::LastYearDueAmount => "last_year_due_amount",
            Field::TotalDueAmount => "total_due_amount",
            Field::DeedBook => "deed_book",
            Field::DeedPage => "deed_page",
            Field::TaxStatus => "tax_status",
            Field::AuctionType => "auction_type",
            Field::OpeningBid => "opening_bid",
            Field::CurrentBid => "current_bid",
            Field::AuctionEndTime => "auction_end_time",
            Field::RedemptionPeriod => "redemption_period",
            Field::DocumentUrls => "document_urls",
            Field::PropertyTitle => "property_title",
            Field::NumberOfBids => "number_of_bids",
            Field::Seller => "seller",
            Field::Notes => "notes",
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Field::ImageUrls | Field::DocumentUrls)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Flat cell rendering used by rows and the store.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items.join("; "),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Complete,
    Partial,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Complete => "complete",
            RecordStatus::Partial => "partial",
            RecordStatus::Failed => "failed",
        }
    }
}

/// Normalised field set produced for every record page, whatever the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    fields: BTreeMap<Field, FieldValue>,
    parse_errors: Vec<String>,
    failed: bool,
}

impl CanonicalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a locator whose page could never be fetched.
    pub fn failed(cause: impl Into<String>) -> Self {
        let mut record = Self::new();
        record.failed = true;
        record.note_error(cause);
        record
    }

    /// Set a text field; empty or whitespace-only values are ignored.
    pub fn set_text(&mut self, field: Field, value: impl AsRef<str>) {
        let value = value.as_ref().trim();
        if !value.is_empty() {
            self.fields.insert(field, FieldValue::Text(value.to_string()));
        }
    }

    pub fn set_list(&mut self, field: Field, values: Vec<String>) {
        let values: Vec<String> = values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if !values.is_empty() {
            self.fields.insert(field, FieldValue::List(values));
        }
    }

    /// Set only when no earlier rule already filled the field.
    pub fn set_text_if_absent(&mut self, field: Field, value: impl AsRef<str>) {
        if !self.fields.contains_key(&field) {
            self.set_text(field, value);
        }
    }

    pub fn has(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        if field == Field::ParseError {
            return None;
        }
        self.fields.get(&field)
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        match self.fields.get(&field) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn parcel_id(&self) -> Option<&str> {
        self.text(Field::ParcelId)
    }

    pub fn note_error(&mut self, msg: impl Into<String>) {
        self.parse_errors.push(msg.into());
    }

    pub fn parse_error(&self) -> Option<String> {
        if self.parse_errors.is_empty() {
            None
        } else {
            Some(self.parse_errors.join("; "))
        }
    }

    pub fn status(&self) -> RecordStatus {
        if self.failed {
            RecordStatus::Failed
        } else if self.parcel_id().is_none() {
            RecordStatus::Partial
        } else {
            RecordStatus::Complete
        }
    }

    /// Number of populated content fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Fixed-width row in `Field::ALL` order; missing fields are empty.
    pub fn row(&self) -> Vec<String> {
        Field::ALL
            .iter()
            .map(|f| match f {
                Field::ParseError => self.parse_error().unwrap_or_default(),
                other => self.fields.get(other).map(|v| v.to_cell()).unwrap_or_default(),
            })
            .collect()
    }

    /// Rebuild from a stored row (inverse of `row`).
    pub fn from_row(cells: &[Option<String>], status: RecordStatus) -> Self {
        let mut record = Self::new();
        record.failed = status == RecordStatus::Failed;
        for (field, cell) in Field::ALL.iter().zip(cells) {
            let Some(cell) = cell.as_deref().filter(|c| !c.is_empty()) else {
                continue;
            };
            match field {
                Field::ParseError => record.note_error(cell),
                f if f.is_list() => {
                    record.set_list(*f, cell.split("; ").map(String::from).collect())
                }
                f => record.set_text(*f, cell),
            }
        }
        record
    }
}
