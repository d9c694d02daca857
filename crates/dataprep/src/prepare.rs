use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    analyze, read_csv, read_json, split_rows, write_json, CleanRow, ColumnSchema, OutlierConfig,
    Partition, RawTable, Result, SchemaConfig, SplitCounts, SplitRatios,
};

pub const PROCESSED_DIR: &str = "processed";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const COLUMN_SCHEMA_FILE: &str = "column_schema.json";
pub const OUTLIER_METADATA_FILE: &str = "outlier_metadata.json";
pub const SPLIT_METADATA_FILE: &str = "split_metadata.json";

#[derive(Clone, Debug, Default)]
pub struct PrepConfig {
    pub schema: SchemaConfig,
    pub outliers: OutlierConfig,
    pub ratios: SplitRatios,
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub struct PrepSummary {
    pub processed_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub rows_removed: usize,
    pub counts: SplitCounts,
    pub schema_version: String,
}

/// `X_train.csv, y_train.csv, X_val.csv, ...`
pub fn processed_files() -> Vec<String> {
    Partition::ALL
        .iter()
        .flat_map(|p| [format!("X_{p}.csv"), format!("y_{p}.csv")])
        .collect()
}

/// Every file a successful run leaves under the output root, relative to it.
pub fn required_outputs() -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = processed_files()
        .into_iter()
        .map(|f| Path::new(PROCESSED_DIR).join(f))
        .collect();
    for f in [COLUMN_SCHEMA_FILE, OUTLIER_METADATA_FILE, SPLIT_METADATA_FILE] {
        out.push(Path::new(ARTIFACTS_DIR).join(f));
    }
    out
}

/// Required outputs missing under `root`; empty when the set is complete.
pub fn verify_outputs(root: &Path) -> Vec<PathBuf> {
    required_outputs()
        .into_iter()
        .filter(|rel| !root.join(rel).is_file())
        .collect()
}

pub fn load_schema(path: &Path) -> Result<ColumnSchema> {
    read_json(path)
}

pub fn prepare(input: &Path, output_root: &Path, cfg: &PrepConfig) -> Result<PrepSummary> {
    info!(input=%input.display(), "prepare: reading raw data");
    let table = read_csv(input)?;
    prepare_table(&table, output_root, cfg)
}

/// Analyze, split and write. Nothing touches `output_root` until every
/// check has passed; files are staged in a sibling directory and swapped in.
pub fn prepare_table(
    table: &RawTable,
    output_root: &Path,
    cfg: &PrepConfig,
) -> Result<PrepSummary> {
    let analysis = analyze(table, &cfg.schema, &cfg.outliers)?;
    let (plan, split_meta) = split_rows(
        &analysis.rows,
        &cfg.ratios,
        cfg.seed,
        &analysis.schema.label.column,
    )?;

    fs::create_dir_all(output_root)?;
    let staging = output_root.join(format!(".staging-{}", Uuid::new_v4()));
    let staged = (|| -> Result<()> {
        let processed = staging.join(PROCESSED_DIR);
        let artifacts = staging.join(ARTIFACTS_DIR);
        fs::create_dir_all(&processed)?;
        fs::create_dir_all(&artifacts)?;

        let features = analysis.schema.feature_columns();
        for p in Partition::ALL {
            let rows: Vec<&CleanRow> = plan.get(p).iter().map(|&i| &analysis.rows[i]).collect();
            write_features(&processed.join(format!("X_{p}.csv")), &features, &rows)?;
            let label = &analysis.schema.label.column;
            write_labels(&processed.join(format!("y_{p}.csv")), label, &rows)?;
        }

        write_json(&artifacts.join(COLUMN_SCHEMA_FILE), &analysis.schema)?;
        write_json(&artifacts.join(OUTLIER_METADATA_FILE), &analysis.outliers)?;
        write_json(&artifacts.join(SPLIT_METADATA_FILE), &split_meta)?;
        Ok(())
    })();

    if let Err(e) = staged.and_then(|_| swap_in(&staging, output_root)) {
        if let Err(cleanup) = fs::remove_dir_all(&staging) {
            warn!(dir=%staging.display(), error=%cleanup, "prepare: staging cleanup failed");
        }
        return Err(e);
    }
    fs::remove_dir_all(&staging)?;

    let summary = PrepSummary {
        processed_dir: output_root.join(PROCESSED_DIR),
        artifacts_dir: output_root.join(ARTIFACTS_DIR),
        rows_read: table.len(),
        rows_rejected: analysis.schema.rows_rejected,
        rows_removed: analysis.outliers.rows_removed,
        counts: split_meta.counts,
        schema_version: analysis.schema.version.clone(),
    };
    info!(
        train = summary.counts.train,
        val = summary.counts.val,
        test = summary.counts.test,
        schema_version = %summary.schema_version,
        "prepare: written"
    );
    Ok(summary)
}

/// Moves the staged `processed/` and `artifacts/` over any previous ones.
/// On failure the previous directories are put back.
fn swap_in(staging: &Path, root: &Path) -> Result<()> {
    swap_in_with(staging, root, |from, to| fs::rename(from, to))
}

fn swap_in_with<F>(staging: &Path, root: &Path, mut rename: F) -> Result<()>
where
    F: FnMut(&Path, &Path) -> io::Result<()>,
{
    const DIRS: [&str; 2] = [PROCESSED_DIR, ARTIFACTS_DIR];
    let previous = staging.join("previous");
    fs::create_dir_all(&previous)?;

    let mut set_aside = Vec::new();
    let mut placed = Vec::new();
    let moved = (|| -> io::Result<()> {
        for dir in DIRS {
            let target = root.join(dir);
            if target.exists() {
                rename(&target, &previous.join(dir))?;
                set_aside.push(dir);
            }
        }
        for dir in DIRS {
            rename(&staging.join(dir), &root.join(dir))?;
            placed.push(dir);
        }
        Ok(())
    })();

    if let Err(e) = moved {
        for dir in placed {
            if let Err(err) = fs::remove_dir_all(root.join(dir)) {
                warn!(dir, error=%err, "prepare: could not remove partial output");
            }
        }
        for dir in set_aside {
            if let Err(err) = fs::rename(previous.join(dir), root.join(dir)) {
                warn!(dir, error=%err, "prepare: could not restore previous output");
            }
        }
        return Err(e.into());
    }
    Ok(())
}

fn write_features(path: &Path, header: &[&str], rows: &[&CleanRow]) -> Result<()> {
    let mut w = WriterBuilder::new().from_path(path)?;
    w.write_record(header)?;
    for r in rows {
        w.write_record(r.features.iter().map(|v| v.to_string()))?;
    }
    w.flush()?;
    Ok(())
}

fn write_labels(path: &Path, column: &str, rows: &[&CleanRow]) -> Result<()> {
    let mut w = WriterBuilder::new().from_path(path)?;
    w.write_record([column])?;
    for r in rows {
        w.write_record([r.label.as_str()])?;
    }
    w.flush()?;
    Ok(())
}
