//! Data preparation for the engine-condition classifier.
//!
//! Reads raw sensor CSV, captures a column schema, bounds outliers, and
//! produces a deterministic stratified train/validation/test split.

mod analyzer;
mod artifact;
mod outliers;
mod prepare;
mod schema;
mod split;
mod table;

pub use analyzer::{analyze, Analysis};
pub use artifact::{read_json, write_json};
pub use outliers::{
    analyze_outliers, apply_policy, column_bounds, ColumnBounds, OutlierConfig, OutlierMetadata,
    OutlierMethod, OutlierPolicy,
};
pub use prepare::{
    load_schema, prepare, prepare_table, processed_files, required_outputs, verify_outputs,
    PrepConfig, PrepSummary, ARTIFACTS_DIR, COLUMN_SCHEMA_FILE, OUTLIER_METADATA_FILE,
    PROCESSED_DIR, SPLIT_METADATA_FILE,
};
pub use schema::{
    infer_schema, CleanRow, ColumnRole, ColumnSchema, ColumnSpec, ColumnType, LabelSpec,
    SchemaConfig, SchemaError, ValueRange,
};
pub use split::{
    allocate, fingerprint_rows, split_rows, stratified_split, Partition, SplitCounts,
    SplitError, SplitMetadata, SplitPlan, SplitRatios,
};
pub use table::{read_csv, RawRecord, RawTable};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataPrepError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Ser(String),
}

pub type Result<T> = std::result::Result<T, DataPrepError>;
