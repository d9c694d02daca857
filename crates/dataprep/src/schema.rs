use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::RawTable;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("column `{0}` is missing from the input")]
    MissingColumn(String),

    #[error("column `{0}` appears more than once in the header")]
    DuplicateColumn(String),

    #[error("column `{0}` is not part of the declared schema")]
    UnknownColumn(String),

    #[error(
        "column `{column}` is declared numeric but row {row} holds `{value}` \
         ({count} non-numeric values, {allowed} tolerated)"
    )]
    NonNumeric {
        column: String,
        row: usize,
        value: String,
        count: usize,
        allowed: usize,
    },

    #[error("feature column `{column}` is not numeric (row {row} holds `{value}`)")]
    NonNumericFeature {
        column: String,
        row: usize,
        value: String,
    },

    #[error("label column `{column}` has no value at row {row}")]
    MissingLabel { column: String, row: usize },

    #[error("label column `{column}` must hold exactly two classes, found {found:?}")]
    NotBinary { column: String, found: Vec<String> },

    #[error("positive label `{label}` is not one of {classes:?}")]
    UnknownPositiveLabel { label: String, classes: Vec<String> },

    #[error("no feature columns left after exclusions")]
    NoFeatures,

    #[error("no usable rows in the input")]
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Feature,
    Label,
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub role: ColumnRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_range: Option<ValueRange>,
    #[serde(default)]
    pub missing: usize,
    #[serde(default)]
    pub invalid: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub column: String,
    pub classes: Vec<String>,
    pub positive: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub version: String,
    pub columns: Vec<ColumnSpec>,
    pub label: LabelSpec,
    pub rows_total: usize,
    pub rows_rejected: usize,
}

impl ColumnSchema {
    /// Feature columns in file order.
    pub fn feature_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.role == ColumnRole::Feature)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Structural fingerprint: names, types, roles and label classes.
    /// Observed ranges and counts do not participate.
    pub fn compute_version(columns: &[ColumnSpec], label: &LabelSpec) -> String {
        let mut hasher = blake3::Hasher::new();
        for c in columns {
            let line = format!("{}\t{:?}\t{:?}\n", c.name, c.column_type, c.role);
            hasher.update(line.as_bytes());
        }
        hasher.update(b"label\t");
        hasher.update(label.column.as_bytes());
        for class in &label.classes {
            hasher.update(b"\t");
            hasher.update(class.as_bytes());
        }
        hasher.update(b"\t+");
        hasher.update(label.positive.as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }

    pub fn verify_version(&self) -> bool {
        Self::compute_version(&self.columns, &self.label) == self.version
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub label_column: String,
    pub positive_label: String,
    pub exclude_columns: Vec<String>,
    /// When non-empty, these are the only feature columns allowed.
    pub declared_numeric: Vec<String>,
    /// Fraction of rows a declared column may hold non-numeric values in
    /// before the whole input is refused.
    pub tolerance: f64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            label_column: "Engine Condition".to_string(),
            positive_label: "1".to_string(),
            exclude_columns: vec![],
            declared_numeric: vec![],
            tolerance: 0.0,
        }
    }
}

/// A row that passed schema checks: feature values in `feature_columns` order.
#[derive(Clone, Debug, PartialEq)]
pub struct CleanRow {
    pub index: usize,
    pub features: Vec<f64>,
    pub label: String,
}

fn is_missing(cell: &str) -> bool {
    cell.trim().is_empty()
}

fn parse_number(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Default)]
struct CellStats {
    missing: usize,
    non_numeric: usize,
    first_bad: Option<(usize, String)>,
}

pub fn infer_schema(
    table: &RawTable,
    cfg: &SchemaConfig,
) -> std::result::Result<(ColumnSchema, Vec<CleanRow>), SchemaError> {
    let mut seen = HashSet::new();
    for h in &table.headers {
        if !seen.insert(h.as_str()) {
            return Err(SchemaError::DuplicateColumn(h.clone()));
        }
    }

    let label_idx = table
        .column_index(&cfg.label_column)
        .ok_or_else(|| SchemaError::MissingColumn(cfg.label_column.clone()))?;

    for d in &cfg.declared_numeric {
        if table.column_index(d).is_none() {
            return Err(SchemaError::MissingColumn(d.clone()));
        }
    }
    for x in &cfg.exclude_columns {
        if table.column_index(x).is_none() {
            warn!(column=%x, "schema: excluded column not present");
        }
    }

    let rows_total = table.len();
    if rows_total == 0 {
        return Err(SchemaError::Empty);
    }

    // per-column cell statistics
    let mut stats: Vec<CellStats> = table.headers.iter().map(|_| CellStats::default()).collect();
    for rec in &table.records {
        for (col, st) in stats.iter_mut().enumerate() {
            let cell = rec.cell(col);
            if is_missing(cell) {
                st.missing += 1;
            } else if parse_number(cell).is_none() {
                st.non_numeric += 1;
                if st.first_bad.is_none() {
                    st.first_bad = Some((rec.index + 1, cell.to_string()));
                }
            }
        }
    }

    let allowed = (cfg.tolerance.max(0.0) * rows_total as f64).floor() as usize;
    let declared: HashSet<&str> = cfg.declared_numeric.iter().map(String::as_str).collect();
    let excluded: HashSet<&str> = cfg.exclude_columns.iter().map(String::as_str).collect();

    let mut columns = Vec::with_capacity(table.headers.len());
    let mut feature_idx = Vec::new();

    for (col, name) in table.headers.iter().enumerate() {
        let st = &stats[col];
        let inferred = if st.non_numeric == 0 && st.missing < rows_total {
            ColumnType::Numeric
        } else {
            ColumnType::Categorical
        };

        let (column_type, role) = if col == label_idx {
            (inferred, ColumnRole::Label)
        } else if excluded.contains(name.as_str()) {
            (inferred, ColumnRole::Ignored)
        } else if declared.contains(name.as_str()) {
            if st.non_numeric > allowed {
                let (row, value) = st.first_bad.clone().unwrap_or_default();
                return Err(SchemaError::NonNumeric {
                    column: name.clone(),
                    row,
                    value,
                    count: st.non_numeric,
                    allowed,
                });
            }
            (ColumnType::Numeric, ColumnRole::Feature)
        } else if !declared.is_empty() {
            return Err(SchemaError::UnknownColumn(name.clone()));
        } else {
            if inferred != ColumnType::Numeric {
                let (row, value) = st.first_bad.clone().unwrap_or_default();
                return Err(SchemaError::NonNumericFeature {
                    column: name.clone(),
                    row,
                    value,
                });
            }
            (ColumnType::Numeric, ColumnRole::Feature)
        };

        if role == ColumnRole::Feature {
            feature_idx.push(col);
        }
        columns.push(ColumnSpec {
            name: name.clone(),
            column_type,
            role,
            valid_range: None,
            missing: st.missing,
            invalid: if role == ColumnRole::Feature { st.non_numeric } else { 0 },
        });
    }

    if feature_idx.is_empty() {
        return Err(SchemaError::NoFeatures);
    }

    let mut classes = BTreeSet::new();
    for rec in &table.records {
        let v = rec.cell(label_idx);
        if is_missing(v) {
            return Err(SchemaError::MissingLabel {
                column: cfg.label_column.clone(),
                row: rec.index + 1,
            });
        }
        classes.insert(v.to_string());
    }
    let classes: Vec<String> = classes.into_iter().collect();
    if classes.len() != 2 {
        return Err(SchemaError::NotBinary {
            column: cfg.label_column.clone(),
            found: classes,
        });
    }
    if !classes.contains(&cfg.positive_label) {
        return Err(SchemaError::UnknownPositiveLabel {
            label: cfg.positive_label.clone(),
            classes,
        });
    }

    let mut rows = Vec::with_capacity(rows_total);
    let mut rows_rejected = 0usize;
    'rows: for rec in &table.records {
        let mut features = Vec::with_capacity(feature_idx.len());
        for &col in &feature_idx {
            match parse_number(rec.cell(col)) {
                Some(v) => features.push(v),
                None => {
                    rows_rejected += 1;
                    continue 'rows;
                }
            }
        }
        rows.push(CleanRow {
            index: rec.index,
            features,
            label: rec.cell(label_idx).to_string(),
        });
    }

    if rows.is_empty() {
        return Err(SchemaError::Empty);
    }
    if rows_rejected > 0 {
        warn!(
            rows_rejected,
            rows_total,
            "schema: rows rejected for missing or non-numeric features"
        );
    }

    for (k, &col) in feature_idx.iter().enumerate() {
        let (min, max) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r.features[k]), hi.max(r.features[k]))
        });
        columns[col].valid_range = Some(ValueRange { min, max });
    }

    let label = LabelSpec {
        column: cfg.label_column.clone(),
        classes,
        positive: cfg.positive_label.clone(),
    };
    let version = ColumnSchema::compute_version(&columns, &label);

    Ok((
        ColumnSchema {
            version,
            columns,
            label,
            rows_total,
            rows_rejected,
        },
        rows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(csv: &str) -> RawTable {
        RawTable::from_reader(csv.as_bytes()).unwrap()
    }

    fn cfg() -> SchemaConfig {
        SchemaConfig {
            label_column: "label".into(),
            positive_label: "Faulty".into(),
            ..Default::default()
        }
    }

    #[test]
    fn infers_numeric_features_and_label() {
        let t = table("rpm,temp,label\n700,80,Normal\n900,82.5,Faulty\n650,79,Normal\n");
        let (schema, rows) = infer_schema(&t, &cfg()).unwrap();

        assert_eq!(schema.feature_columns(), vec!["rpm", "temp"]);
        let label = schema.column("label").unwrap();
        assert_eq!(label.role, ColumnRole::Label);
        assert_eq!(label.column_type, ColumnType::Categorical);
        assert_eq!(schema.label.classes, vec!["Faulty", "Normal"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].features, vec![900.0, 82.5]);

        let rpm = schema.column("rpm").unwrap().valid_range.unwrap();
        assert_eq!((rpm.min, rpm.max), (650.0, 900.0));
        assert!(schema.verify_version());
    }

    #[test]
    fn declared_numeric_column_with_text_is_refused() {
        let t = table("rpm,label\n700,Normal\nN/A,Faulty\n800,Normal\n");
        let cfg = SchemaConfig {
            declared_numeric: vec!["rpm".into()],
            ..cfg()
        };
        let err = infer_schema(&t, &cfg).unwrap_err();
        assert_eq!(
            err,
            SchemaError::NonNumeric {
                column: "rpm".into(),
                row: 2,
                value: "N/A".into(),
                count: 1,
                allowed: 0,
            }
        );
    }

    #[test]
    fn tolerance_rejects_rows_instead_of_failing() {
        let t = table("rpm,label\n700,Normal\nN/A,Faulty\n800,Normal\n750,Faulty\n");
        let cfg = SchemaConfig {
            declared_numeric: vec!["rpm".into()],
            tolerance: 0.25,
            ..cfg()
        };
        let (schema, rows) = infer_schema(&t, &cfg).unwrap();
        assert_eq!(schema.rows_rejected, 1);
        assert_eq!(schema.column("rpm").unwrap().invalid, 1);
        assert_eq!(rows.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn undeclared_column_is_unknown_when_schema_declared() {
        let t = table("rpm,extra,label\n1,2,Normal\n3,4,Faulty\n");
        let cfg = SchemaConfig {
            declared_numeric: vec!["rpm".into()],
            ..cfg()
        };
        assert_eq!(
            infer_schema(&t, &cfg).unwrap_err(),
            SchemaError::UnknownColumn("extra".into())
        );
    }

    #[test]
    fn text_feature_is_refused_unless_excluded() {
        let t = table("id,rpm,label\nA1,700,Normal\nB2,800,Faulty\n");
        assert!(matches!(
            infer_schema(&t, &cfg()),
            Err(SchemaError::NonNumericFeature { .. })
        ));

        let cfg = SchemaConfig {
            exclude_columns: vec!["id".into()],
            ..cfg()
        };
        let (schema, rows) = infer_schema(&t, &cfg).unwrap();
        assert_eq!(schema.column("id").unwrap().role, ColumnRole::Ignored);
        assert_eq!(rows[0].features, vec![700.0]);
    }

    #[test]
    fn missing_feature_rejects_row() {
        let t = table("rpm,temp,label\n700,,Normal\n800,81,Faulty\n900,82,Normal\n");
        let (schema, rows) = infer_schema(&t, &cfg()).unwrap();
        assert_eq!(schema.rows_rejected, 1);
        assert_eq!(schema.column("temp").unwrap().missing, 1);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn label_must_be_binary() {
        let t = table("rpm,label\n1,Normal\n2,Faulty\n3,Unknown\n");
        assert!(matches!(infer_schema(&t, &cfg()), Err(SchemaError::NotBinary { .. })));

        let t = table("rpm,label\n1,Normal\n2,Normal\n");
        assert!(matches!(infer_schema(&t, &cfg()), Err(SchemaError::NotBinary { .. })));
    }

    #[test]
    fn positive_label_must_exist() {
        let t = table("rpm,label\n1,0\n2,1\n");
        assert!(matches!(
            infer_schema(&t, &cfg()),
            Err(SchemaError::UnknownPositiveLabel { .. })
        ));
    }

    #[test]
    fn version_tracks_structure_not_values() {
        let a = table("rpm,label\n1,Normal\n2,Faulty\n");
        let b = table("rpm,label\n10,Normal\n20,Faulty\n30,Faulty\n");
        let c = table("speed,label\n1,Normal\n2,Faulty\n");
        let va = infer_schema(&a, &cfg()).unwrap().0.version;
        let vb = infer_schema(&b, &cfg()).unwrap().0.version;
        let vc = infer_schema(&c, &cfg()).unwrap().0.version;
        assert_eq!(va, vb);
        assert_ne!(va, vc);
    }
}
