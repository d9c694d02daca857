use tracing::info;

use crate::outliers::{analyze_outliers, apply_policy};
use crate::{
    infer_schema, CleanRow, ColumnSchema, OutlierConfig, OutlierMetadata, RawTable, SchemaConfig,
};

/// Output of the schema and outlier pass: both artifacts plus the rows that
/// survived them, with the outlier policy already applied.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub schema: ColumnSchema,
    pub outliers: OutlierMetadata,
    pub rows: Vec<CleanRow>,
}

pub fn analyze(
    table: &RawTable,
    schema_cfg: &SchemaConfig,
    outlier_cfg: &OutlierConfig,
) -> crate::Result<Analysis> {
    let (schema, rows) = infer_schema(table, schema_cfg)?;
    let features = schema.feature_columns();

    let mut outliers = analyze_outliers(&features, &rows, outlier_cfg);
    let rows = apply_policy(rows, &mut outliers);

    for b in &outliers.columns {
        if b.rows_affected > 0 {
            info!(
                column=%b.name,
                lower=b.lower,
                upper=b.upper,
                rows=b.rows_affected,
                "outliers: flagged"
            );
        }
    }
    info!(
        rows_total = schema.rows_total,
        rows_rejected = schema.rows_rejected,
        rows_removed = outliers.rows_removed,
        policy = %outliers.policy,
        "analyze: done"
    );

    Ok(Analysis { schema, outliers, rows })
}
