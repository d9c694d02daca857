use std::io::Read;
use std::path::Path;

use csv::ReaderBuilder;

use crate::Result;

/// One row as read from the source file. `index` is the 0-based data row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    pub index: usize,
    pub cells: Vec<String>,
}

impl RawRecord {
    pub fn cell(&self, col: usize) -> &str {
        self.cells.get(col).map(String::as_str).unwrap_or("")
    }
}

#[derive(Clone, Debug, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let records = rows
            .into_iter()
            .enumerate()
            .map(|(index, cells)| RawRecord { index, cells })
            .collect();
        Self { headers, records }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn from_reader<R: Read>(rdr: R) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(rdr);

        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for rec in reader.records() {
            let rec = rec?;
            rows.push(rec.iter().map(str::to_string).collect());
        }
        Ok(Self::new(headers, rows))
    }
}

pub fn read_csv(path: &Path) -> Result<RawTable> {
    let file = std::fs::File::open(path)?;
    RawTable::from_reader(std::io::BufReader::new(file))
}
