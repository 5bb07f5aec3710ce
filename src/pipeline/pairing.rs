//! Record pairing.
//!
//! Joins every manifest line with the output name the backend will write:
//! `<stem>_masks_<model>-<variant>`. Pairing is all-or-nothing; a duplicate
//! identifier or an unusable line aborts it with no records returned.

use crate::models::{
    InputRecord, MaskflowError, ModelSpec, OutputSpec, PairedRecord, Result, Stage,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;
use tracing::{debug, info};

/// Column name of the manifest header written by tabular exports.
pub const CSV_HEADER: &str = "img_path";

/// Lazy reader over manifest lines.
///
/// Yields `(line_number, record)` for every non-blank line. Line numbers are
/// 1-based. A first non-blank line of `img_path` (or `img_path,...`) switches
/// to CSV mode, where only the first column of each row is used.
pub struct ManifestReader<R> {
    lines: Lines<R>,
    line_no: usize,
    started: bool,
    csv: bool,
}

impl ManifestReader<BufReader<File>> {
    /// Open a manifest file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            MaskflowError::io(Stage::Pairing, format!("opening manifest {}", path.display()), e)
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ManifestReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            started: false,
            csv: false,
        }
    }

    fn is_header(line: &str) -> bool {
        line == CSV_HEADER
            || line
                .strip_prefix(CSV_HEADER)
                .is_some_and(|rest| rest.starts_with(','))
    }
}

impl<R: BufRead> Iterator for ManifestReader<R> {
    type Item = Result<(usize, InputRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(MaskflowError::io(Stage::Pairing, "reading manifest", e))),
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if !self.started {
                self.started = true;
                if Self::is_header(trimmed) {
                    debug!("Manifest has CSV header");
                    self.csv = true;
                    continue;
                }
            }

            let path = if self.csv {
                first_csv_field(trimmed)
            } else {
                trimmed.to_string()
            };

            return Some(match InputRecord::from_path(&path) {
                Some(record) => Ok((self.line_no, record)),
                None => Err(MaskflowError::InvalidInput(format!(
                    "manifest line {}: '{}' has no file name",
                    self.line_no, path
                ))),
            });
        }
    }
}

/// First field of a CSV row. A quoted field may contain commas; `""` inside
/// quotes is a literal quote.
fn first_csv_field(row: &str) -> String {
    let Some(quoted) = row.strip_prefix('"') else {
        return row.split(',').next().unwrap_or_default().trim().to_string();
    };

    let mut field = String::new();
    let mut chars = quoted.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            field.push(c);
        } else if chars.peek() == Some(&'"') {
            chars.next();
            field.push('"');
        } else {
            break;
        }
    }
    field.trim().to_string()
}

/// Pair every record of the manifest at `manifest_path` for `model`.
pub fn pair(manifest_path: &Path, model: &ModelSpec) -> Result<Vec<PairedRecord>> {
    let records = pair_records(ManifestReader::open(manifest_path)?, model)?;
    info!(
        manifest = %manifest_path.display(),
        records = records.len(),
        "Paired manifest records"
    );
    Ok(records)
}

/// Pair records from any source of manifest lines.
pub fn pair_records<I>(records: I, model: &ModelSpec) -> Result<Vec<PairedRecord>>
where
    I: IntoIterator<Item = Result<(usize, InputRecord)>>,
{
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut paired = Vec::new();

    for item in records {
        let (line, input) = item?;

        if let Some(first) = seen.get(&input.identifier) {
            return Err(MaskflowError::DuplicateIdentifier {
                identifier: input.identifier,
                first: first.clone(),
                second: input.source_path,
                line,
            });
        }
        seen.insert(input.identifier.clone(), input.source_path.clone());

        let output = OutputSpec::for_record(&input, model);
        let record = PairedRecord::join(input, output).ok_or_else(|| {
            MaskflowError::internal(Stage::Pairing, "output name keyed on a different identifier")
        })?;
        paired.push(record);
    }

    Ok(paired)
}

/// Pair in-memory manifest lines.
pub fn pair_lines<S: AsRef<str>>(lines: &[S], model: &ModelSpec) -> Result<Vec<PairedRecord>> {
    let text = lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    pair_records(ManifestReader::new(text.as_bytes()), model)
}
