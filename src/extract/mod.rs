//! Pure mapping from a record page's HTML to a `CanonicalRecord`.
//!
//! Each platform has an ordered rule list per field (first non-empty match
//! wins) followed by table extractors for grids and totals blocks. Nothing
//! here aborts a record: structural surprises land in `parse_error`.

pub mod offices;
pub mod rules;
pub mod tables;

use scraper::Html;

use crate::model::{CanonicalRecord, Field, Platform, RawPage};

pub fn extract(platform: Platform, html: &str) -> CanonicalRecord {
    let doc = Html::parse_document(html);
    let profile = rules::profile(platform);
    let mut record = CanonicalRecord::new();

    for (field, field_rules) in &profile.fields {
        if let Some(value) = field_rules.iter().find_map(|rule| rule.apply(&doc)) {
            record.set_text(*field, value);
        }
    }

    for table in profile.tables {
        if let Err(reason) = table.apply(&doc, &mut record) {
            record.note_error(reason);
        }
    }

    if !record.has(Field::ParcelId) {
        record.note_error("parcel id element not found");
    }
    record
}

pub fn extract_page(page: &RawPage) -> CanonicalRecord {
    extract(page.locator.platform, &page.html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordStatus;

    fn fixture(name: &str) -> String {
        let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn qpublic_record_page() {
        let record = extract(Platform::QPublic, &fixture("qpublic_record.html"));
        assert_eq!(record.parcel_id(), Some("R06259-050"));
        assert_eq!(record.text(Field::Owner), Some("SMITH JOHN & MARY"));
        assert_eq!(record.text(Field::LegalDescription), Some("LOT 4 BLK 2 MOUNTAINBURG ADD"));
        assert_eq!(record.text(Field::PropertyTaxAccount), Some("38112"));
        assert_eq!(record.text(Field::CurrentDueAmount), Some("$120.00"));
        assert_eq!(record.text(Field::LastYearDueAmount), Some("$80.00"));
        assert_eq!(record.text(Field::TotalDueAmount), Some("$200.00"));
        assert_eq!(record.status(), RecordStatus::Complete);
        assert_eq!(record.parse_error(), None);
    }

    #[test]
    fn beacon_record_page() {
        let record = extract(Platform::Beacon, &fixture("beacon_record.html"));
        assert_eq!(record.parcel_id(), Some("12-34-56-0001"));
        assert_eq!(record.text(Field::LandValue), Some("$15,000"));
        assert_eq!(record.text(Field::AssessedValue), Some("$18,400"));
        assert_eq!(record.text(Field::LastSaleDate), Some("06/01/2018"));
        assert_eq!(record.text(Field::LastSalePrice), Some("$142,500"));
        assert_eq!(record.text(Field::DeedBook), Some("1021"));
        assert_eq!(record.text(Field::DeedPage), Some("233"));
        assert_eq!(record.text(Field::Exemptions), Some("Homestead, Veteran"));
        assert_eq!(record.text(Field::YearBuilt), Some("1978"));
        assert!(record.text(Field::MapUrl).unwrap().contains("gis"));
        assert_eq!(
            record.get(Field::ImageUrls).map(|v| v.to_cell()).as_deref(),
            Some("https://img.example/property/1001.jpg")
        );
    }

    #[test]
    fn tyler_record_page() {
        let record = extract(Platform::Tyler, &fixture("tyler_record.html"));
        assert_eq!(record.parcel_id(), Some("0450-12-001"));
        assert_eq!(record.text(Field::Owner), Some("DOE JANE"));
        assert_eq!(record.text(Field::TaxYear), Some("2024"));
        assert_eq!(record.text(Field::TaxAmountDue), Some("$2,310.44"));
        assert_eq!(record.text(Field::TaxStatus), Some("Unpaid"));
        assert_eq!(record.text(Field::LastSalePrice), Some("$88,000"));
    }

    #[test]
    fn bid4assets_item_page() {
        let record = extract(Platform::Bid4Assets, &fixture("bid4assets_item.html"));
        assert_eq!(record.parcel_id(), Some("APN 019-220-14"));
        assert_eq!(record.text(Field::PropertyType), Some("Vacant Land"));
        assert_eq!(record.text(Field::LegalDescription), Some("PARCEL 2 OF PM 44/12"));
        assert_eq!(record.text(Field::OpeningBid), Some("$1,500"));
        assert_eq!(record.text(Field::LotSize), Some("2.5 acres"));
        assert_eq!(record.text(Field::TaxAmountDue), Some("$640.12"));
        assert_eq!(record.text(Field::TaxYear), Some("2023"));
        assert_eq!(record.text(Field::PropertyTitle), Some("Riverside County Tax Sale"));
        assert_eq!(record.text(Field::NumberOfBids), Some("7"));
        assert_eq!(record.text(Field::Seller), Some("Riverside County Treasurer-Tax Collector"));
        assert_eq!(record.text(Field::Notes), Some("Sold as is. Buyer pays recording fees."));
        assert_eq!(
            record.get(Field::DocumentUrls).map(|v| v.to_cell()).as_deref(),
            Some("https://www.bid4assets.com/docs/title-report.pdf")
        );
    }

    #[test]
    fn page_without_parcel_id_is_partial() {
        let record = extract(Platform::QPublic, &fixture("partial_record.html"));
        assert_eq!(record.parcel_id(), None);
        assert_eq!(record.text(Field::Owner), Some("JONES ROBERT"));
        assert_eq!(record.status(), RecordStatus::Partial);
        assert!(record.parse_error().unwrap().contains("parcel id"));
    }

    #[test]
    fn empty_page_never_panics() {
        for p in Platform::ALL {
            let record = extract(p, "");
            assert_eq!(record.status(), RecordStatus::Partial);
        }
    }
}
