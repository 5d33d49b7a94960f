//! Build patient records from CSV exports.
//!
//! The header must carry every column in [`REQUIRED_COLUMNS`]; other columns
//! are ignored. Rows without a name, with an age that is not a whole number
//! between 1 and `u32::MAX`, or with bytes that are not UTF-8 are skipped.
//! Either the whole file yields records or nothing does.

pub mod sample;

use std::io;

use csv::{ErrorKind, ReaderBuilder, StringRecord, Trim};
use guardian_core::records::{fields, Record, RecordId, RecordSet};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Columns an import file must provide, in the order sample files use.
pub const REQUIRED_COLUMNS: [&str; 5] = [
    fields::NAME,
    fields::AGE,
    fields::MEDICAL_HISTORY,
    fields::CURRENT_CONDITIONS,
    fields::CURRENT_MEDICATIONS,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImportError {
    /// Header lacks required columns; no row was looked at.
    #[error("csv header is missing required column(s): {}", .missing.join(", "))]
    Format { missing: Vec<String> },
    /// Every data row was rejected.
    #[error("csv contained no valid rows")]
    EmptyResult,
    #[error("csv could not be read: {reason}")]
    Malformed { reason: String },
    #[error("csv could not be written: {reason}")]
    Write { reason: String },
}

/// Parse `input` into new records with ids that do not clash with `existing`.
///
/// The returned mapping holds only the new records; merging is up to the caller.
#[instrument(skip_all)]
pub fn import_csv<R: io::Read>(input: R, existing: &RecordSet) -> Result<RecordSet, ImportError> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers().map_err(malformed)?.clone();
    let columns = Columns::resolve(&headers)?;

    let mut imported = RecordSet::new();
    let mut skipped = 0usize;
    for row in reader.records() {
        let row = match row {
            Ok(row) => row,
            Err(err) if matches!(err.kind(), ErrorKind::Utf8 { .. }) => {
                skipped += 1;
                let line = err.position().map(|p| p.line()).unwrap_or_default();
                debug!(line, "skipping row: {err}");
                continue;
            }
            Err(err) => return Err(malformed(err)),
        };
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        match columns.validate(&row) {
            Ok(valid) => {
                let id = RecordId::generate_unique(|id| {
                    existing.contains_key(id) || imported.contains_key(id)
                });
                imported.insert(id.clone(), valid.into_record(&id));
            }
            Err(reason) => {
                skipped += 1;
                debug!(line, "skipping row: {reason}");
            }
        }
    }

    if imported.is_empty() {
        return Err(ImportError::EmptyResult);
    }
    info!(imported = imported.len(), skipped, "csv import finished");
    Ok(imported)
}

/// Positions of the required columns within the header.
struct Columns {
    name: usize,
    age: usize,
    medical_history: usize,
    current_conditions: usize,
    current_medications: usize,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Result<Self, ImportError> {
        let position = |column: &str| headers.iter().position(|h| h == column);
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|&&column| position(column).is_none())
            .map(|column| column.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::Format { missing });
        }

        let index = |column: &str| position(column).unwrap_or_default();
        Ok(Self {
            name: index(fields::NAME),
            age: index(fields::AGE),
            medical_history: index(fields::MEDICAL_HISTORY),
            current_conditions: index(fields::CURRENT_CONDITIONS),
            current_medications: index(fields::CURRENT_MEDICATIONS),
        })
    }

    fn validate<'r>(&self, row: &'r StringRecord) -> Result<ValidRow<'r>, String> {
        // Short rows are tolerated; missing cells read as empty.
        let cell = move |index: usize| row.get(index).unwrap_or_default();

        let name = cell(self.name);
        if name.is_empty() {
            return Err("empty name".to_string());
        }
        let age = match cell(self.age).parse::<u32>() {
            Ok(age) if age > 0 => age,
            _ => return Err(format!("age {:?} is not a positive integer", cell(self.age))),
        };

        Ok(ValidRow {
            name,
            age,
            medical_history: cell(self.medical_history),
            current_conditions: cell(self.current_conditions),
            current_medications: cell(self.current_medications),
        })
    }
}

struct ValidRow<'r> {
    name: &'r str,
    age: u32,
    medical_history: &'r str,
    current_conditions: &'r str,
    current_medications: &'r str,
}

impl ValidRow<'_> {
    fn into_record(self, id: &RecordId) -> Record {
        Record::new(id)
            .with(fields::NAME, self.name)
            .with(fields::AGE, self.age)
            .with(fields::MEDICAL_HISTORY, self.medical_history)
            .with(fields::CURRENT_CONDITIONS, self.current_conditions)
            .with(fields::CURRENT_MEDICATIONS, self.current_medications)
    }
}

fn malformed(err: csv::Error) -> ImportError {
    ImportError::Malformed {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "name,age,medical_history,current_conditions,current_medications";

    fn import(body: &str) -> Result<RecordSet, ImportError> {
        import_csv(format!("{HEADER}\n{body}").as_bytes(), &RecordSet::new())
    }

    #[test]
    fn keeps_valid_row_and_drops_nameless_one() {
        let imported = import("Ann,40,None,Healthy,None\n,30,Asthma,Cold,Inhaler\n").expect("import");

        assert_eq!(imported.len(), 1);
        let (id, record) = imported.iter().next().expect("one record");
        assert_eq!(id.as_str().len(), RecordId::LEN);
        assert_eq!(record.id(), Some(id.as_str()));
        assert_eq!(record.name(), Some("Ann"));
        assert_eq!(record.age(), Some(40));
        assert_eq!(
            record.get(fields::CURRENT_CONDITIONS).and_then(|v| v.as_text()),
            Some("Healthy")
        );
    }

    #[test]
    fn rejects_non_positive_or_non_numeric_ages() {
        let imported = import(
            "Neg,-5,a,b,c\nWord,abc,a,b,c\nZero,0,a,b,c\nBlank,,a,b,c\nFrac,4.5,a,b,c\nOk,  41 ,a,b,c\n",
        )
        .expect("import");

        assert_eq!(imported.len(), 1);
        let record = imported.values().next().expect("one record");
        assert_eq!(record.name(), Some("Ok"));
        assert_eq!(record.age(), Some(41));
    }

    #[test]
    fn row_with_invalid_utf8_is_skipped() {
        let mut input = format!("{HEADER}\nAnn,40,None,Healthy,None\n").into_bytes();
        input.extend_from_slice(b"B\xffb,30,None,Healthy,None\nCy,50,None,Healthy,None\n");

        let imported = import_csv(input.as_slice(), &RecordSet::new()).expect("import");
        let mut names: Vec<_> = imported.values().filter_map(Record::name).collect();
        names.sort();
        assert_eq!(names, vec!["Ann", "Cy"]);
    }

    #[test]
    fn age_beyond_u32_is_rejected() {
        let err = import("Old,4294967296,a,b,c\n").expect_err("out of range");
        assert_eq!(err, ImportError::EmptyResult);
    }

    #[test]
    fn missing_column_fails_before_rows() {
        let input = "name,age,current_conditions,current_medications\nAnn,40,Healthy,None\n";
        let err = import_csv(input.as_bytes(), &RecordSet::new()).expect_err("format error");
        assert_eq!(
            err,
            ImportError::Format {
                missing: vec!["medical_history".to_string()]
            }
        );
    }

    #[test]
    fn empty_input_is_format_error() {
        let err = import_csv("".as_bytes(), &RecordSet::new()).expect_err("no header");
        assert!(matches!(err, ImportError::Format { missing } if missing.len() == REQUIRED_COLUMNS.len()));
    }

    #[test]
    fn all_rows_invalid_is_empty_result() {
        let err = import(",40,a,b,c\nBob,-1,a,b,c\n").expect_err("nothing valid");
        assert_eq!(err, ImportError::EmptyResult);

        let err = import("").expect_err("header only");
        assert_eq!(err, ImportError::EmptyResult);
    }

    #[test]
    fn column_order_extra_columns_and_quoting() {
        let input = "\
current_medications, age ,notes,name,current_conditions,medical_history
\"Aspirin, Statins\",67,ignored,  Liam Martinez  ,Anxiety,\"Diabetes, Hypertension\"
";
        let imported = import_csv(input.as_bytes(), &RecordSet::new()).expect("import");
        let record = imported.values().next().expect("one record");

        assert_eq!(record.name(), Some("Liam Martinez"));
        assert_eq!(record.age(), Some(67));
        assert_eq!(
            record.get(fields::MEDICAL_HISTORY).and_then(|v| v.as_text()),
            Some("Diabetes, Hypertension")
        );
        assert_eq!(
            record.get(fields::CURRENT_MEDICATIONS).and_then(|v| v.as_text()),
            Some("Aspirin, Statins")
        );
        assert!(record.get("notes").is_none());
    }

    #[test]
    fn short_rows_read_missing_cells_as_empty() {
        let imported = import("Ann,40\n").expect("import");
        let record = imported.values().next().expect("one record");
        assert_eq!(
            record.get(fields::CURRENT_MEDICATIONS).and_then(|v| v.as_text()),
            Some("")
        );
    }

    #[test]
    fn new_ids_do_not_clash_with_existing_records() {
        let mut existing = RecordSet::new();
        for _ in 0..50 {
            let id = RecordId::generate();
            existing.insert(id.clone(), Record::new(&id));
        }
        let body: String = (1..=50).map(|i| format!("Patient {i},{i},a,b,c\n")).collect();

        let imported = import_csv(format!("{HEADER}\n{body}").as_bytes(), &existing).expect("import");
        assert_eq!(imported.len(), 50);
        assert!(imported.keys().all(|id| !existing.contains_key(id)));
    }
}
