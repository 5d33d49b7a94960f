//! Synthetic patient CSV in the import format, for demos and tests.

use std::io;

use rand::{seq::SliceRandom, Rng};

use crate::{ImportError, REQUIRED_COLUMNS};

const NAMES: &[&str] = &[
    "John Doe",
    "Jane Smith",
    "Alice Johnson",
    "Bob Brown",
    "Sophia Taylor",
    "Liam Martinez",
    "Emma Garcia",
    "Noah Gonzalez",
];

const HISTORIES: &[&str] = &[
    "None",
    "Diabetes, Hypertension",
    "Asthma, Allergy",
    "Previous surgery: Appendectomy",
    "Heart disease",
    "Thyroid issues",
    "Migraine history",
];

const CONDITIONS: &[&str] = &[
    "Healthy",
    "Cold and cough",
    "Mild fever",
    "Chronic back pain",
    "Anxiety",
    "Seasonal allergies",
    "Shortness of breath",
];

const MEDICATIONS: &[&str] = &[
    "None",
    "Paracetamol, Vitamin D",
    "Ibuprofen, Amoxicillin",
    "Omeprazole, Metformin",
    "Blood thinners, Beta blockers",
    "Aspirin, Statins",
];

/// Write a header plus `rows` random patients to `writer`.
pub fn write_sample_csv<W, R>(writer: W, rows: usize, rng: &mut R) -> Result<(), ImportError>
where
    W: io::Write,
    R: Rng + ?Sized,
{
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(REQUIRED_COLUMNS).map_err(write_err)?;

    for _ in 0..rows {
        let name = format!("{} {}", pick(NAMES, rng), rng.gen_range(1000..=9999));
        let age = rng.gen_range(1..=100u32).to_string();
        let conditions = if rng.gen_bool(0.2) {
            format!("{} and {}", pick(CONDITIONS, rng), pick(CONDITIONS, rng))
        } else {
            pick(CONDITIONS, rng).to_string()
        };
        let medications = if rng.gen_bool(0.3) {
            format!("{}, {}", pick(MEDICATIONS, rng), pick(MEDICATIONS, rng))
        } else {
            pick(MEDICATIONS, rng).to_string()
        };

        out.write_record([
            name.as_str(),
            age.as_str(),
            pick(HISTORIES, rng),
            conditions.as_str(),
            medications.as_str(),
        ])
        .map_err(write_err)?;
    }

    out.flush().map_err(|e| ImportError::Write {
        reason: e.to_string(),
    })
}

fn pick<R: Rng + ?Sized>(pool: &'static [&'static str], rng: &mut R) -> &'static str {
    pool.choose(rng).copied().unwrap_or_default()
}

fn write_err(err: csv::Error) -> ImportError {
    ImportError::Write {
        reason: err.to_string(),
    }
}
