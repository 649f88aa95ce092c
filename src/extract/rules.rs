//! Data-driven locator rules: for each platform, an ordered rule list per
//! canonical field plus the table extractors that run after them.
//! Adding a platform means adding rows here, not new control flow.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

use super::tables::TableRule;
use crate::model::{Field, Platform};
use crate::session::dom::normalized_text;

/// One way of locating a field's value. Patterns are case-insensitive regexes.
#[derive(Debug, Clone, Copy)]
pub enum Rule {
    /// Text of the first element whose id matches.
    Id(&'static str),
    /// `href` of the first element whose id matches.
    IdHref(&'static str),
    /// Like `Id`, restricted to the first container whose class matches.
    IdIn {
        container: &'static str,
        id: &'static str,
    },
    /// Text of the first element whose class matches.
    Class(&'static str),
    /// Text matching a label; value is the rest of its parent, else the next sibling.
    Label(&'static str),
    /// Text matching a label; value is the element after the label's parent.
    LabelNext(&'static str),
    /// Text of the first `tag` element whose class matches.
    TagClass {
        tag: &'static str,
        class: &'static str,
    },
}

#[derive(Debug)]
pub(crate) enum Compiled {
    Id(Regex),
    IdHref(Regex),
    IdIn { container: Regex, id: Regex },
    Class(Regex),
    Label(Regex),
    LabelNext(Regex),
    TagClass { tag: &'static str, class: Regex },
}

pub(crate) fn ci(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){}", pattern)).unwrap()
}

impl Rule {
    fn compile(&self) -> Compiled {
        match *self {
            Rule::Id(p) => Compiled::Id(ci(p)),
            Rule::IdHref(p) => Compiled::IdHref(ci(p)),
            Rule::IdIn { container, id } => Compiled::IdIn {
                container: ci(container),
                id: ci(id),
            },
            Rule::Class(p) => Compiled::Class(ci(p)),
            Rule::Label(p) => Compiled::Label(ci(p)),
            Rule::LabelNext(p) => Compiled::LabelNext(ci(p)),
            Rule::TagClass { tag, class } => Compiled::TagClass { tag, class: ci(class) },
        }
    }
}

static ID_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[id]").unwrap());
static CLASS_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("[class]").unwrap());

const SKIPPED_TEXT_PARENTS: &[&str] = &["script", "style", "title", "noscript"];

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Elements under `scope` (document order) whose id matches.
pub(crate) fn by_id<'a>(scope: ElementRef<'a>, re: &Regex) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    let re = re.clone();
    scope
        .select(&ID_SEL)
        .filter(move |el| el.value().id().map(|id| re.is_match(id)).unwrap_or(false))
}

pub(crate) fn by_class<'a>(scope: ElementRef<'a>, re: &Regex) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    let re = re.clone();
    scope.select(&CLASS_SEL).filter(move |el| {
        el.value()
            .attr("class")
            .map(|c| re.is_match(c))
            .unwrap_or(false)
    })
}

/// Parent element of the first text node matching `re`.
pub(crate) fn label_parent<'a>(scope: ElementRef<'a>, re: &Regex) -> Option<ElementRef<'a>> {
    scope.descendants().find_map(|node| {
        let Node::Text(text) = node.value() else {
            return None;
        };
        if !re.is_match(text) {
            return None;
        }
        let parent = node.parent().and_then(ElementRef::wrap)?;
        if SKIPPED_TEXT_PARENTS.contains(&parent.value().name()) {
            return None;
        }
        Some(parent)
    })
}

fn next_element<'a>(el: ElementRef<'a>) -> Option<ElementRef<'a>> {
    el.next_siblings().find_map(ElementRef::wrap)
}

impl Compiled {
    pub(crate) fn apply(&self, doc: &Html) -> Option<String> {
        let root = doc.root_element();
        match self {
            Compiled::Id(re) => by_id(root, re).find_map(|el| non_empty(normalized_text(el))),
            Compiled::IdHref(re) => by_id(root, re)
                .find_map(|el| el.value().attr("href").map(str::to_string).and_then(non_empty)),
            Compiled::IdIn { container, id } => {
                let scope = by_class(root, container).next()?;
                by_id(scope, id).find_map(|el| non_empty(normalized_text(el)))
            }
            Compiled::Class(re) => by_class(root, re).find_map(|el| non_empty(normalized_text(el))),
            Compiled::Label(re) => {
                let parent = label_parent(root, re)?;
                let whole = normalized_text(parent);
                let rest = re.find(&whole).map(|m| &whole[m.end()..]).unwrap_or("");
                let rest = rest.trim_matches(|c: char| c == ':' || c.is_whitespace());
                non_empty(rest.to_string())
                    .or_else(|| next_element(parent).and_then(|n| non_empty(normalized_text(n))))
            }
            Compiled::LabelNext(re) => {
                let parent = label_parent(root, re)?;
                next_element(parent).and_then(|n| non_empty(normalized_text(n)))
            }
            Compiled::TagClass { tag, class } => by_class(root, class)
                .filter(|el| el.value().name().eq_ignore_ascii_case(tag))
                .find_map(|el| non_empty(normalized_text(el))),
        }
    }
}

pub struct Profile {
    pub(crate) fields: Vec<(Field, Vec<Compiled>)>,
    pub tables: &'static [TableRule],
}

// ── Rule tables ──

const INFO: &str = "tabular-data-two-column";

const SCHNEIDER_RULES: &[(Field, &[Rule])] = &[
    (
        Field::ParcelId,
        &[
            Rule::IdIn { container: INFO, id: "_lblParcelID" },
            Rule::Id("lblParcelID"),
            Rule::Id("ParcelNumber"),
            Rule::Label(r"^\s*Parcel (ID|Number)\s*:?\s*$"),
        ],
    ),
    (
        Field::Owner,
        &[
            Rule::Id("ctlBodyPane_ctl01_ctl00_lblName"),
            Rule::Id("_lblOwner|OwnerName"),
            Rule::Id("lnkOwnerName"),
        ],
    ),
    (
        Field::SiteAddress,
        &[
            Rule::IdHref("InfoPane2_lnkWebsite"),
            Rule::Id("_lblSiteAddress|_lblLocationAddress|_lblPropertyAddress"),
        ],
    ),
    (
        Field::MailingAddress,
        &[Rule::IdIn { container: INFO, id: "_lblMailingAddress" }, Rule::Id("MailingAddress")],
    ),
    (
        Field::LegalDescription,
        &[
            Rule::IdIn { container: INFO, id: "_lblLegalDescription" },
            Rule::Id("LegalDescription"),
        ],
    ),
    (
        Field::PropertyTaxAccount,
        &[Rule::IdIn { container: INFO, id: "_lblPropertyID" }, Rule::Id("_lblPropertyID")],
    ),
    (
        Field::PropertyType,
        &[
            Rule::IdIn { container: INFO, id: "_lblPropertyType|_lblUseCode" },
            Rule::Id("_lblPropertyClass|_lblClass"),
        ],
    ),
    (
        Field::BuildingSqft,
        &[Rule::IdIn { container: INFO, id: "_lblSquareFeet|_lblLivingArea" }],
    ),
    (Field::YearBuilt, &[Rule::IdIn { container: INFO, id: "_lblYearBuilt" }, Rule::Id("_lblYearBuilt")]),
    (Field::Bedrooms, &[Rule::IdIn { container: INFO, id: "_lblBedrooms" }]),
    (Field::Bathrooms, &[Rule::IdIn { container: INFO, id: "_lblBathrooms" }]),
    (Field::LotSize, &[Rule::IdIn { container: INFO, id: "_lblLotSize|_lblAcres" }]),
    (Field::Zoning, &[Rule::IdIn { container: INFO, id: "_lblZoning" }]),
];

const QPUBLIC_TABLES: &[TableRule] = &[
    TableRule::DueTotals {
        table_id: "_grdValuation|_grdTax",
        row_class: "double-total-line",
        value_class: "value-column",
    },
    TableRule::MapLink { href: "map|gis" },
];

const BEACON_TABLES: &[TableRule] = &[
    TableRule::DueTotals {
        table_id: "_grdValuation|_grdTax",
        row_class: "double-total-line|total-row",
        value_class: "value-column",
    },
    TableRule::ValuationRows { table_id: "_grdValuation|_grdTax" },
    TableRule::LastSale { table_id: "_grdSales|_grdTransfer", min_cells: 3, deed: true },
    TableRule::Exemptions { table_id: "_grdExemption" },
    TableRule::Images { src: "property|parcel|building", container_class: None },
    TableRule::MapLink { href: "map|gis" },
];

const TYLER_RULES: &[(Field, &[Rule])] = &[
    (
        Field::ParcelId,
        &[
            Rule::Id("lblParcelID"),
            Rule::Id("ParcelNumber"),
            Rule::Id("PropertyID"),
            Rule::Id("ctlBodyPane.*ParcelID"),
        ],
    ),
    (Field::Owner, &[Rule::Id("lblOwner"), Rule::Id("OwnerName"), Rule::Id("ctlBodyPane.*Owner")]),
    (
        Field::SiteAddress,
        &[Rule::Id("lblSiteAddress"), Rule::Id("PropertyAddress"), Rule::Id("SitusAddress")],
    ),
    (Field::MailingAddress, &[Rule::Id("lblMailingAddress"), Rule::Id("MailingAddress")]),
    (
        Field::PropertyType,
        &[Rule::Id("lblPropertyType"), Rule::Id("PropertyClass"), Rule::Id("LandUse")],
    ),
    (Field::LandValue, &[Rule::Id("LandValue|AssessedLand")]),
    (Field::ImprovementValue, &[Rule::Id("ImprovementValue|AssessedImprovement")]),
    (Field::AssessedValue, &[Rule::Id("TotalValue|AssessedTotal|MarketValue")]),
    (Field::LegalDescription, &[Rule::Id("LegalDescription|Legal")]),
    (Field::BuildingSqft, &[Rule::Id("SquareFeet|LivingArea|BuildingArea")]),
    (Field::YearBuilt, &[Rule::Id("YearBuilt|ConstructionYear")]),
    (Field::Bedrooms, &[Rule::Id("Bedrooms|BedCount")]),
    (Field::Bathrooms, &[Rule::Id("Bathrooms|BathCount")]),
    (Field::LotSize, &[Rule::Id("LotSize|Acreage|LotAcres")]),
    (Field::Exemptions, &[Rule::Id("Exemption|Homestead")]),
];

const TYLER_TABLES: &[TableRule] = &[
    TableRule::TaxHistory { table_id: "Tax|Assessment" },
    TableRule::LastSale { table_id: "Sales|Transfer", min_cells: 2, deed: false },
    TableRule::Delinquency,
];

const BID4ASSETS_RULES: &[(Field, &[Rule])] = &[
    (Field::ParcelId, &[Rule::Label(r"Parcel|Tax ID")]),
    (Field::SiteAddress, &[Rule::Class("address|location")]),
    (Field::PropertyType, &[Rule::Label("Property Type")]),
    (Field::AssessedValue, &[Rule::Label("Assessed Value")]),
    (Field::LegalDescription, &[Rule::LabelNext("Legal Description")]),
    (Field::Owner, &[Rule::Label("Current Owner|Owner")]),
    (Field::RedemptionPeriod, &[Rule::Label("Redemption Period")]),
    (Field::AuctionType, &[Rule::Label("Sale Type|Auction Type")]),
    (Field::CurrentBid, &[Rule::Class("current-bid|high-bid")]),
    (Field::OpeningBid, &[Rule::Class("opening-bid|starting-bid")]),
    (Field::AuctionEndTime, &[Rule::Class("end-time|closes")]),
    (Field::PropertyTitle, &[Rule::TagClass { tag: "h1", class: "title|property-name" }]),
    (Field::NumberOfBids, &[Rule::Class("bid-count|number-of-bids")]),
    (Field::Seller, &[Rule::Label("Seller|Jurisdiction")]),
    (Field::Notes, &[Rule::TagClass { tag: "div", class: "notes|comments|description" }]),
];

const BID4ASSETS_TABLES: &[TableRule] = &[
    TableRule::DetailsTable { table_class: "details|specifications" },
    TableRule::TaxSection { container_id: "tax|assessment" },
    TableRule::Images { src: ".", container_class: Some("gallery|images") },
    TableRule::Documents,
];

fn compile(rules_by_field: &[(Field, &[Rule])], tables: &'static [TableRule]) -> Profile {
    Profile {
        fields: rules_by_field
            .iter()
            .map(|(field, rules)| (*field, rules.iter().map(Rule::compile).collect()))
            .collect(),
        tables,
    }
}

static PROFILES: LazyLock<HashMap<Platform, Profile>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    m.insert(Platform::QPublic, compile(SCHNEIDER_RULES, QPUBLIC_TABLES));
    m.insert(Platform::Beacon, compile(SCHNEIDER_RULES, BEACON_TABLES));
    m.insert(Platform::Tyler, compile(TYLER_RULES, TYLER_TABLES));
    m.insert(Platform::Bid4Assets, compile(BID4ASSETS_RULES, BID4ASSETS_TABLES));
    m
});

pub fn profile(platform: Platform) -> &'static Profile {
    &PROFILES[&platform]
}
