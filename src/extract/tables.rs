//! Structured extractors for the tabular parts of a record page. Each runs
//! after the field rules and only fills fields those left empty.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::rules::{by_class, by_id, ci, label_parent};
use crate::model::{CanonicalRecord, Field};
use crate::session::dom::normalized_text;

static TR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());
static TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

static DEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:book|bk)\D{0,3}(\d+)\D+(?:page|pg)\D{0,3}(\d+)").unwrap());
static DEED_PAIR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*[/-]\s*(\d+)\s*$").unwrap());
static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}/\d{1,2}/\d{2,4}$|^\d{4}-\d{2}-\d{2}$").unwrap());
static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\s?[\d,]+(?:\.\d{2})?").unwrap());
static DELINQUENT_RE: LazyLock<Regex> = LazyLock::new(|| ci("delinquent|past due"));
static TAX_AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| ci("tax amount|taxes due"));
static TAX_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| ci("tax year"));
static DOCUMENT_RE: LazyLock<Regex> = LazyLock::new(|| ci(r"\.pdf($|\?)|document|download"));

#[derive(Debug, Clone, Copy)]
pub enum TableRule {
    /// Three total rows: current due, prior year due, total due.
    DueTotals {
        table_id: &'static str,
        row_class: &'static str,
        value_class: &'static str,
    },
    /// Label/value rows feeding the valuation fields.
    ValuationRows { table_id: &'static str },
    /// First data row of a sales grid: date, price, then deed reference.
    LastSale {
        table_id: &'static str,
        min_cells: usize,
        deed: bool,
    },
    /// First cell of each data row.
    Exemptions { table_id: &'static str },
    /// Most recent row of a year/assessed/tax/status history grid.
    TaxHistory { table_id: &'static str },
    /// A delinquency notice with a dollar amount nearby.
    Delinquency,
    /// Two-column detail table with free-form labels.
    DetailsTable { table_class: &'static str },
    /// Container holding tax amount and tax year labels.
    TaxSection { container_id: &'static str },
    Images {
        src: &'static str,
        container_class: Option<&'static str>,
    },
    MapLink { href: &'static str },
    Documents,
}

fn cells(row: ElementRef<'_>) -> Vec<String> {
    row.select(&CELL).map(normalized_text).collect()
}

/// Rows that carry at least one `td`, skipping header rows.
fn data_rows<'a>(table: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    table
        .select(&TR)
        .filter(|row| row.select(&TD).next().is_some())
        .collect()
}

fn first_table<'a>(doc: &'a Html, table_id: &str) -> Option<ElementRef<'a>> {
    by_id(doc.root_element(), &ci(table_id)).next()
}

fn valuation_field(label: &str) -> Option<Field> {
    let label = label.to_lowercase();
    if label.contains("land") {
        Some(Field::LandValue)
    } else if label.contains("building") || label.contains("improvement") {
        Some(Field::ImprovementValue)
    } else if label.contains("total") || label.contains("market") {
        Some(Field::MarketValue)
    } else if label.contains("assessed") {
        Some(Field::AssessedValue)
    } else {
        None
    }
}

fn detail_field(label: &str) -> Option<Field> {
    let label = label.to_lowercase();
    if label.contains("bedroom") {
        Some(Field::Bedrooms)
    } else if label.contains("bathroom") {
        Some(Field::Bathrooms)
    } else if label.contains("square") || label.contains("sq ft") || label.contains("sqft") {
        Some(Field::BuildingSqft)
    } else if label.contains("year built") {
        Some(Field::YearBuilt)
    } else if label.contains("lot") || label.contains("acre") {
        Some(Field::LotSize)
    } else if label.contains("zoning") {
        Some(Field::Zoning)
    } else {
        None
    }
}

fn deed_reference(text: &str) -> Option<(String, String)> {
    DEED_RE
        .captures(text)
        .or_else(|| DEED_PAIR_RE.captures(text))
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

impl TableRule {
    /// Fill `record` from `doc`. An `Err` describes structure that did not
    /// match the expected shape; the caller notes it and carries on.
    pub fn apply(&self, doc: &Html, record: &mut CanonicalRecord) -> Result<(), String> {
        match *self {
            TableRule::DueTotals {
                table_id,
                row_class,
                value_class,
            } => {
                let Some(table) = first_table(doc, table_id) else {
                    return Ok(());
                };
                let row_re = ci(row_class);
                let value_re = ci(value_class);
                // Positions count every total row, including ones without a value cell.
                let values: Vec<Option<String>> = table
                    .select(&TR)
                    .filter(|r| r.value().attr("class").map(|c| row_re.is_match(c)).unwrap_or(false))
                    .map(|r| by_class(r, &value_re).next().map(normalized_text))
                    .collect();
                if values.len() < 3 {
                    return Ok(());
                }
                let targets: [&[Field]; 3] = [
                    &[Field::CurrentDueAmount],
                    &[Field::LastYearDueAmount],
                    &[Field::TotalDueAmount, Field::TaxAmountDue],
                ];
                for (value, fields) in values.iter().zip(targets) {
                    let Some(value) = value else { continue };
                    for field in fields {
                        record.set_text_if_absent(*field, value);
                    }
                }
                Ok(())
            }
            TableRule::ValuationRows { table_id } => {
                let Some(table) = first_table(doc, table_id) else {
                    return Ok(());
                };
                let mut mapped = 0;
                for row in data_rows(table) {
                    let c = cells(row);
                    if c.len() < 2 {
                        continue;
                    }
                    if let Some(field) = valuation_field(&c[0]) {
                        record.set_text_if_absent(field, &c[1]);
                        mapped += 1;
                    }
                }
                if mapped == 0 {
                    return Err("valuation table has no recognised rows".into());
                }
                Ok(())
            }
            TableRule::LastSale {
                table_id,
                min_cells,
                deed,
            } => {
                let Some(table) = first_table(doc, table_id) else {
                    return Ok(());
                };
                let Some(row) = data_rows(table).into_iter().next() else {
                    return Ok(());
                };
                let c = cells(row);
                if c.len() < min_cells {
                    return Err(format!("sales row has {} cells, expected {}", c.len(), min_cells));
                }
                if !DATE_RE.is_match(&c[0]) && !c[0].chars().any(|ch| ch.is_ascii_digit()) {
                    return Err(format!("sales row starts with {:?}, not a date", c[0]));
                }
                record.set_text_if_absent(Field::LastSaleDate, &c[0]);
                record.set_text_if_absent(Field::LastSalePrice, &c[1]);
                if deed {
                    if let Some((book, page)) = c.iter().skip(2).find_map(|t| deed_reference(t)) {
                        record.set_text_if_absent(Field::DeedBook, book);
                        record.set_text_if_absent(Field::DeedPage, page);
                    }
                }
                Ok(())
            }
            TableRule::Exemptions { table_id } => {
                let Some(table) = first_table(doc, table_id) else {
                    return Ok(());
                };
                if record.has(Field::Exemptions) {
                    return Ok(());
                }
                let names: Vec<String> = data_rows(table)
                    .into_iter()
                    .filter_map(|row| cells(row).into_iter().next())
                    .filter(|n| !n.is_empty())
                    .collect();
                record.set_text(Field::Exemptions, names.join(", "));
                Ok(())
            }
            TableRule::TaxHistory { table_id } => {
                let re = ci(table_id);
                let Some(table) = by_id(doc.root_element(), &re).find(|el| el.value().name() == "table") else {
                    return Ok(());
                };
                let Some(row) = data_rows(table).into_iter().next() else {
                    return Ok(());
                };
                let c = cells(row);
                if c.len() < 3 {
                    return Err(format!("tax history row has {} cells, expected 3", c.len()));
                }
                record.set_text_if_absent(Field::TaxYear, &c[0]);
                record.set_text_if_absent(Field::AssessedValue, &c[1]);
                record.set_text_if_absent(Field::TaxAmountDue, &c[2]);
                if let Some(status) = c.get(3) {
                    record.set_text_if_absent(Field::TaxStatus, status);
                }
                Ok(())
            }
            TableRule::Delinquency => {
                let Some(notice) = label_parent(doc.root_element(), &DELINQUENT_RE) else {
                    return Ok(());
                };
                record.set_text_if_absent(Field::TaxStatus, "delinquent");
                let text = normalized_text(notice);
                if let Some(m) = MONEY_RE.find(&text) {
                    record.set_text_if_absent(Field::TaxAmountDue, m.as_str());
                }
                Ok(())
            }
            TableRule::DetailsTable { table_class } => {
                let re = ci(table_class);
                let Some(table) = by_class(doc.root_element(), &re).find(|el| el.value().name() == "table") else {
                    return Ok(());
                };
                for row in table.select(&TR) {
                    let c = cells(row);
                    if c.len() < 2 {
                        continue;
                    }
                    if let Some(field) = detail_field(&c[0]) {
                        record.set_text_if_absent(field, &c[1]);
                    }
                }
                Ok(())
            }
            TableRule::TaxSection { container_id } => {
                let re = ci(container_id);
                let Some(section) = by_id(doc.root_element(), &re).find(|el| el.value().name() == "div") else {
                    return Ok(());
                };
                let value_after = |label: &Regex| {
                    let parent = label_parent(section, label)?;
                    let whole = normalized_text(parent);
                    let rest = label.find(&whole).map(|m| whole[m.end()..].to_string())?;
                    let rest = rest.trim_matches(|c: char| c == ':' || c.is_whitespace()).to_string();
                    if rest.is_empty() {
                        parent
                            .next_siblings()
                            .find_map(ElementRef::wrap)
                            .map(normalized_text)
                    } else {
                        Some(rest)
                    }
                };
                if let Some(amount) = value_after(&*TAX_AMOUNT_RE) {
                    record.set_text_if_absent(Field::TaxAmountDue, amount);
                }
                if let Some(year) = value_after(&*TAX_YEAR_RE) {
                    record.set_text_if_absent(Field::TaxYear, year);
                }
                Ok(())
            }
            TableRule::Images { src, container_class } => {
                if record.has(Field::ImageUrls) {
                    return Ok(());
                }
                let scope = match container_class {
                    Some(class) => match by_class(doc.root_element(), &ci(class)).next() {
                        Some(el) => el,
                        None => return Ok(()),
                    },
                    None => doc.root_element(),
                };
                let src_re = ci(src);
                let mut urls: Vec<String> = Vec::new();
                for img in scope.select(&IMG) {
                    let Some(url) = img.value().attr("src") else { continue };
                    if src_re.is_match(url) && !urls.iter().any(|u| u == url) {
                        urls.push(url.to_string());
                    }
                }
                record.set_list(Field::ImageUrls, urls);
                Ok(())
            }
            TableRule::MapLink { href } => {
                let re = ci(href);
                let link = doc
                    .root_element()
                    .select(&LINK)
                    .filter_map(|a| a.value().attr("href"))
                    .find(|h| re.is_match(h) && !h.starts_with("javascript:"));
                if let Some(link) = link {
                    record.set_text_if_absent(Field::MapUrl, link);
                }
                Ok(())
            }
            TableRule::Documents => {
                let mut urls: Vec<String> = Vec::new();
                for a in doc.root_element().select(&LINK) {
                    let Some(href) = a.value().attr("href") else { continue };
                    if DOCUMENT_RE.is_match(href) && !urls.iter().any(|u| u == href) {
                        urls.push(href.to_string());
                    }
                }
                record.set_list(Field::DocumentUrls, urls);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(rule: TableRule, html: &str) -> (CanonicalRecord, Result<(), String>) {
        let mut record = CanonicalRecord::new();
        let result = rule.apply(&Html::parse_document(html), &mut record);
        (record, result)
    }

    const DUE: TableRule = TableRule::DueTotals {
        table_id: "_grdValuation",
        row_class: "double-total-line|total-row",
        value_class: "value-column",
    };

    #[test]
    fn due_totals_map_rows_in_order() {
        let html = r#"<table id="ctl_grdValuation">
            <tr class="double-total-line"><td>Current</td><td class="value-column">$120.00</td><td class="value-column">$1.00</td></tr>
            <tr class="total-row"><td>Prior</td><td class="value-column">$80.00</td></tr>
            <tr class="double-total-line"><td>Total</td><td class="value-column">$200.00</td></tr>
        </table>"#;
        let (rec, res) = run(DUE, html);
        assert!(res.is_ok());
        assert_eq!(rec.text(Field::CurrentDueAmount), Some("$120.00"));
        assert_eq!(rec.text(Field::LastYearDueAmount), Some("$80.00"));
        assert_eq!(rec.text(Field::TotalDueAmount), Some("$200.00"));
    }

    #[test]
    fn total_row_without_value_keeps_its_position() {
        let html = r#"<table id="ctl_grdValuation">
            <tr class="double-total-line"><td>Current</td><td>n/a</td></tr>
            <tr class="double-total-line"><td>Prior</td><td class="value-column">$80.00</td></tr>
            <tr class="double-total-line"><td>Total</td><td class="value-column">$200.00</td></tr>
            <tr class="double-total-line"><td>Grand</td><td class="value-column">$999.00</td></tr>
        </table>"#;
        let (rec, res) = run(DUE, html);
        assert!(res.is_ok());
        assert!(!rec.has(Field::CurrentDueAmount));
        assert_eq!(rec.text(Field::LastYearDueAmount), Some("$80.00"));
        assert_eq!(rec.text(Field::TotalDueAmount), Some("$200.00"));
        assert_eq!(rec.text(Field::TaxAmountDue), Some("$200.00"));
    }

    #[test]
    fn due_totals_with_two_rows_leave_fields_empty() {
        let html = r#"<table id="x_grdValuation">
            <tr class="total-row"><td class="value-column">$1</td></tr>
            <tr class="total-row"><td class="value-column">$2</td></tr>
        </table>"#;
        let (rec, res) = run(DUE, html);
        assert!(res.is_ok());
        assert!(!rec.has(Field::CurrentDueAmount));
        assert!(!rec.has(Field::TotalDueAmount));
    }

    #[test]
    fn last_sale_reads_deed_reference() {
        let rule = TableRule::LastSale {
            table_id: "_grdSales",
            min_cells: 3,
            deed: true,
        };
        let html = r#"<table id="p_grdSales"><tr><th>Date</th><th>Price</th><th>Deed</th></tr>
            <tr><td>03/14/2019</td><td>$95,000</td><td>Book 412 Page 88</td></tr>
            <tr><td>01/01/2001</td><td>$10</td><td>1/2</td></tr></table>"#;
        let (rec, _) = run(rule, html);
        assert_eq!(rec.text(Field::LastSaleDate), Some("03/14/2019"));
        assert_eq!(rec.text(Field::LastSalePrice), Some("$95,000"));
        assert_eq!(rec.text(Field::DeedBook), Some("412"));
        assert_eq!(rec.text(Field::DeedPage), Some("88"));
    }

    #[test]
    fn short_sales_row_is_reported() {
        let rule = TableRule::LastSale {
            table_id: "_grdSales",
            min_cells: 3,
            deed: true,
        };
        let html = r#"<table id="p_grdSales"><tr><td>03/14/2019</td></tr></table>"#;
        let (rec, res) = run(rule, html);
        assert!(res.unwrap_err().contains("1 cells"));
        assert!(!rec.has(Field::LastSaleDate));
    }

    #[test]
    fn valuation_labels_route_to_fields() {
        let html = r#"<table id="a_grdValuation">
            <tr><td>Land Value</td><td>$10,000</td></tr>
            <tr><td>Building Value</td><td>$50,000</td></tr>
            <tr><td>Total Market Value</td><td>$60,000</td></tr>
            <tr><td>Assessed Value</td><td>$12,000</td></tr></table>"#;
        let (rec, res) = run(TableRule::ValuationRows { table_id: "_grdValuation" }, html);
        assert!(res.is_ok());
        assert_eq!(rec.text(Field::LandValue), Some("$10,000"));
        assert_eq!(rec.text(Field::ImprovementValue), Some("$50,000"));
        assert_eq!(rec.text(Field::MarketValue), Some("$60,000"));
        assert_eq!(rec.text(Field::AssessedValue), Some("$12,000"));
    }

    #[test]
    fn delinquency_sets_status_and_amount() {
        let html = "<div><p>This parcel is DELINQUENT: $1,234.56 owed</p></div>";
        let (rec, _) = run(TableRule::Delinquency, html);
        assert_eq!(rec.text(Field::TaxStatus), Some("delinquent"));
        assert_eq!(rec.text(Field::TaxAmountDue), Some("$1,234.56"));
    }

    #[test]
    fn images_are_filtered_and_deduplicated() {
        let html = r#"<img src="/photos/parcel_1.jpg"><img src="/logo.png"><img src="/photos/parcel_1.jpg"><img src="/building/2.jpg">"#;
        let rule = TableRule::Images {
            src: "property|parcel|building",
            container_class: None,
        };
        let (rec, _) = run(rule, html);
        assert_eq!(
            rec.get(Field::ImageUrls).map(|v| v.to_cell()).as_deref(),
            Some("/photos/parcel_1.jpg; /building/2.jpg")
        );
    }
}
