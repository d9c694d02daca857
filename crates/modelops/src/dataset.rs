use std::path::Path;

use csv::ReaderBuilder;
use dataprep::{ColumnSchema, Partition, ARTIFACTS_DIR, COLUMN_SCHEMA_FILE, PROCESSED_DIR};

use crate::{ModelOpsError, Result};

/// One processed split, labels encoded as 1 for the schema's positive class.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    pub fn subset(&self, idx: &[usize]) -> Dataset {
        Dataset {
            rows: idx.iter().map(|&i| self.rows[i].clone()).collect(),
            labels: idx.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrainingData {
    pub schema: ColumnSchema,
    pub train: Dataset,
    pub val: Dataset,
    pub test: Dataset,
}

impl TrainingData {
    pub fn feature_columns(&self) -> Vec<String> {
        self.schema.feature_columns().into_iter().map(str::to_string).collect()
    }
}

/// Loads `processed/` splits and `artifacts/column_schema.json` from the
/// data directory written by the preparation stage.
pub fn load_processed(data_dir: &Path) -> Result<TrainingData> {
    let schema = dataprep::load_schema(&data_dir.join(ARTIFACTS_DIR).join(COLUMN_SCHEMA_FILE))?;
    if !schema.verify_version() {
        return Err(ModelOpsError::Dataset(
            "column schema version does not match its contents".into(),
        ));
    }
    let processed = data_dir.join(PROCESSED_DIR);
    Ok(TrainingData {
        train: load_split(&processed, Partition::Train, &schema)?,
        val: load_split(&processed, Partition::Val, &schema)?,
        test: load_split(&processed, Partition::Test, &schema)?,
        schema,
    })
}

pub fn load_split(
    processed: &Path,
    partition: Partition,
    schema: &ColumnSchema,
) -> Result<Dataset> {
    let features = schema.feature_columns();
    let x_path = processed.join(format!("X_{partition}.csv"));
    let y_path = processed.join(format!("y_{partition}.csv"));

    let mut xr = ReaderBuilder::new().from_path(&x_path)?;
    let header: Vec<String> = xr.headers()?.iter().map(str::to_string).collect();
    if header != features {
        return Err(ModelOpsError::Dataset(format!(
            "{}: columns {header:?} do not match schema features {features:?}",
            x_path.display()
        )));
    }
    let mut rows = Vec::new();
    for (i, rec) in xr.records().enumerate() {
        let rec = rec?;
        let row = rec
            .iter()
            .map(|c| c.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| {
                let path = x_path.display();
                ModelOpsError::Dataset(format!("{path}: row {} is not numeric", i + 1))
            })?;
        rows.push(row);
    }

    let mut yr = ReaderBuilder::new().from_path(&y_path)?;
    let y_header: Vec<String> = yr.headers()?.iter().map(str::to_string).collect();
    if y_header != [schema.label.column.clone()] {
        return Err(ModelOpsError::Dataset(format!(
            "{}: expected single column `{}`",
            y_path.display(),
            schema.label.column
        )));
    }
    let mut labels = Vec::with_capacity(rows.len());
    for rec in yr.records() {
        let rec = rec?;
        let value = rec.get(0).unwrap_or("").trim();
        if !schema.label.classes.iter().any(|c| c == value) {
            return Err(ModelOpsError::Dataset(format!(
                "{}: label `{value}` is not one of {:?}",
                y_path.display(),
                schema.label.classes
            )));
        }
        labels.push(u8::from(value == schema.label.positive));
    }

    if labels.len() != rows.len() {
        return Err(ModelOpsError::Dataset(format!(
            "{partition}: {} feature rows but {} labels",
            rows.len(),
            labels.len()
        )));
    }
    Ok(Dataset { rows, labels })
}
