//! Fixed-width CSV rows: every canonical field in order, empty when missing,
//! followed by provenance columns.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::extract::offices::Category;
use crate::model::Field;
use crate::store::{OfficeRow, StoredRecord};

const PROVENANCE: &[&str] = &["status", "platform", "parcel_key", "state", "county", "url"];

fn csv_writer<W: Write>(out: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out)
}

pub fn write_records<W: Write>(out: W, records: &[StoredRecord]) -> Result<()> {
    let mut wtr = csv_writer(out);
    wtr.write_record(Field::ALL.iter().map(|f| f.name()).chain(PROVENANCE.iter().copied()))?;
    for r in records {
        let mut row = r.record.row();
        row.extend([
            r.record.status().as_str().to_string(),
            r.platform.to_string(),
            r.parcel_key.clone(),
            r.state.clone(),
            r.county.clone(),
            r.url.clone(),
        ]);
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_offices<W: Write>(out: W, rows: &[OfficeRow]) -> Result<()> {
    let mut wtr = csv_writer(out);
    wtr.write_record(["state", "county"].into_iter().chain(Category::ALL.iter().map(|c| c.as_str())))?;
    for row in rows {
        let mut cells = vec![row.state.as_str(), row.county.as_str()];
        for category in Category::ALL {
            let url = row
                .offices
                .iter()
                .find(|(c, _)| *c == category)
                .map(|(_, u)| u.as_str())
                .unwrap_or_default();
            cells.push(url);
        }
        wtr.write_record(&cells)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn export_to(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write(&mut out)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalRecord, Platform};

    #[test]
    fn rows_are_fixed_width_and_quoted() {
        let mut record = CanonicalRecord::new();
        record.set_text(Field::ParcelId, "R1");
        record.set_text(Field::Owner, "SMITH, JOHN \"JACK\"");
        let stored = StoredRecord {
            platform: Platform::QPublic,
            parcel_key: "R1".into(),
            url: "https://q.test/?KeyValue=R1".into(),
            state: "AR".into(),
            county: "Crawford County".into(),
            record,
        };

        let mut out = Vec::new();
        write_records(&mut out, &[stored]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].starts_with("parcel_id,owner,site_address,"));
        assert!(lines[0].ends_with(",status,platform,parcel_key,state,county,url"));
        assert!(lines[1].starts_with("R1,\"SMITH, JOHN \"\"JACK\"\"\",,"));
        assert!(lines[1].ends_with(",complete,qpublic,R1,AR,Crawford County,https://q.test/?KeyValue=R1"));
        assert_eq!(lines[0].split(',').count(), Field::ALL.len() + PROVENANCE.len());
    }

    #[test]
    fn multiline_notes_stay_in_one_record() {
        let mut record = CanonicalRecord::new();
        record.set_text(Field::ParcelId, "9001");
        record.set_text(Field::Notes, "Sold as is.\nNo refunds.");
        let stored = StoredRecord {
            platform: Platform::Bid4Assets,
            parcel_key: "9001".into(),
            url: "https://b4a.test/Item/9001".into(),
            state: "CA".into(),
            county: "Riverside County".into(),
            record,
        };

        let mut out = Vec::new();
        write_records(&mut out, &[stored]).unwrap();
        let mut rdr = csv::Reader::from_reader(out.as_slice());
        let rows: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        let notes = Field::ALL.iter().position(|f| *f == Field::Notes).unwrap();
        assert_eq!(&rows[0][notes], "Sold as is.\nNo refunds.");
    }

    #[test]
    fn office_rows_fill_every_category_column() {
        let rows = vec![OfficeRow {
            state: "fl_".into(),
            county: "alachua".into(),
            offices: vec![(Category::Gis, "https://gis.example".into())],
        }];
        let mut out = Vec::new();
        write_offices(&mut out, &rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "state,county,assessor,tax,gis,recorder,taxation,other\nfl_,alachua,,,https://gis.example,,,\n"
        );
    }
}
