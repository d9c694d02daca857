use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use dataprep::{OutlierConfig, PrepConfig, SchemaConfig, SplitRatios};
use modelops::{SearchSpace, TargetMetric, TrainConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageToggles {
    pub data_registration: bool,
    pub data_prep: bool,
    pub model_training: bool,
    pub deployment: bool,
}

impl StageToggles {
    pub fn any_upload(&self) -> bool {
        self.data_registration || self.data_prep || self.model_training || self.deployment
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub stages: StageToggles,

    pub hf_token: Option<String>,
    pub hf_endpoint: String,
    pub dataset_repo_id: Option<String>,
    pub model_repo_id: Option<String>,
    pub space_id: Option<String>,

    pub mlflow_tracking_uri: Option<String>,
    pub experiment_name: String,

    pub data_dir: PathBuf,
    pub raw_data_file: PathBuf,
    pub model_dir: PathBuf,
    pub deploy_dir: PathBuf,
    pub tracking_dir: PathBuf,

    pub prep: PrepConfig,
    pub train: TrainConfig,

    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let stages = StageToggles {
            data_registration: env.flag("RUN_DATA_REGISTRATION", true)?,
            data_prep: env.flag("RUN_DATA_PREP", true)?,
            model_training: env.flag("RUN_MODEL_TRAINING", true)?,
            deployment: env.flag("RUN_DEPLOYMENT", true)?,
        };

        let hf_endpoint = env.or("HF_ENDPOINT", "https://huggingface.co");
        let mlflow_tracking_uri = env.opt("MLFLOW_TRACKING_URI");

        // Tiny sanity checks (fail fast, fail loud)
        if !is_http(&hf_endpoint) {
            bail!("HF_ENDPOINT must start with http:// or https://");
        }
        if let Some(uri) = &mlflow_tracking_uri {
            if !is_http(uri) {
                bail!("MLFLOW_TRACKING_URI must start with http:// or https://");
            }
        }

        let schema = SchemaConfig {
            label_column: env.or("LABEL_COLUMN", "Engine Condition"),
            positive_label: env.or("POSITIVE_LABEL", "1"),
            exclude_columns: env.list("EXCLUDE_COLUMNS"),
            declared_numeric: env.list("DECLARED_NUMERIC"),
            tolerance: env.parsed("SCHEMA_TOLERANCE", 0.0)?,
        };
        if !(0.0..=1.0).contains(&schema.tolerance) {
            bail!("SCHEMA_TOLERANCE must be within [0, 1], got {}", schema.tolerance);
        }

        let outliers = OutlierConfig {
            method: env
                .parsed_with("OUTLIER_METHOD", |s| s.parse().map_err(|e: String| anyhow!(e)))?,
            policy: env
                .parsed_with("OUTLIER_POLICY", |s| s.parse().map_err(|e: String| anyhow!(e)))?,
        };
        let ratios: SplitRatios = env.parsed_with("SPLIT_RATIOS", |s| {
            s.parse::<SplitRatios>().map_err(anyhow::Error::from)
        })?;

        let prep = PrepConfig {
            schema,
            outliers,
            ratios,
            seed: env.parsed("SPLIT_SEED", 42)?,
        };

        let class_names = match env.opt("CLASS_NAMES") {
            Some(raw) => parse_class_names(&raw)?,
            None => TrainConfig::default().class_names,
        };
        let train = TrainConfig {
            trials: env.parsed("TRAIN_TRIALS", 20)?,
            cv_folds: env.parsed("CV_FOLDS", 5)?,
            target: env.parsed_with("TARGET_METRIC", |s| {
                TargetMetric::from_str(s).map_err(|e| anyhow!(e))
            })?,
            seed: env.parsed("TRAIN_SEED", 42)?,
            space: SearchSpace::default(),
            class_names,
        };
        if train.trials == 0 {
            bail!("TRAIN_TRIALS must be at least 1");
        }
        if train.cv_folds < 2 {
            bail!("CV_FOLDS must be at least 2, got {}", train.cv_folds);
        }

        let data_dir = PathBuf::from(env.or("DATA_DIR", "data"));
        let raw_data_file = env
            .opt("RAW_DATA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("engine_data.csv"));

        Ok(Self {
            stages,
            hf_token: env.opt("HF_TOKEN"),
            hf_endpoint: hf_endpoint.trim_end_matches('/').to_string(),
            dataset_repo_id: env.opt("HF_DATASET_REPO_ID"),
            model_repo_id: env.opt("HF_MODEL_REPO_ID"),
            space_id: env.opt("HF_SPACE_ID"),
            mlflow_tracking_uri,
            experiment_name: env.or("MLFLOW_EXPERIMENT_NAME", "engine-predictive-maintenance"),
            data_dir,
            raw_data_file,
            model_dir: PathBuf::from(env.or("MODEL_DIR", "models")),
            deploy_dir: PathBuf::from(env.or("DEPLOY_DIR", "deployment")),
            tracking_dir: PathBuf::from(env.or("TRACKING_DIR", "mlruns")),
            prep,
            train,
            bind_addr: env.or("SERVE_BIND_ADDR", "0.0.0.0:7860"),
        })
    }

    /// Checks everything the enabled stages of `run` will need before any of
    /// them starts.
    pub fn validate_for_run(&self) -> Result<()> {
        if self.stages.any_upload() {
            self.token()?;
        }
        if self.stages.data_registration || self.stages.data_prep {
            self.dataset_repo()?;
        }
        if self.stages.model_training {
            self.model_repo()?;
        }
        if self.stages.deployment {
            self.space()?;
        }
        Ok(())
    }

    pub fn token(&self) -> Result<&str> {
        self.hf_token
            .as_deref()
            .context("Missing required env var: HF_TOKEN (needed by hub upload stages)")
    }

    pub fn dataset_repo(&self) -> Result<&str> {
        self.dataset_repo_id.as_deref().context("Missing required env var: HF_DATASET_REPO_ID")
    }

    pub fn model_repo(&self) -> Result<&str> {
        self.model_repo_id.as_deref().context("Missing required env var: HF_MODEL_REPO_ID")
    }

    pub fn space(&self) -> Result<&str> {
        self.space_id.as_deref().context("Missing required env var: HF_SPACE_ID")
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.opt(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.opt(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("{key} must be a boolean (true/false), got `{v}`"),
            },
        }
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.opt(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e| anyhow!("{key}: invalid value `{v}`: {e}")),
        }
    }

    /// Like `parsed` but for types whose default comes from `Default`.
    fn parsed_with<T, P>(&self, key: &str, parse: P) -> Result<T>
    where
        T: Default,
        P: Fn(&str) -> Result<T>,
    {
        match self.opt(key) {
            None => Ok(T::default()),
            Some(v) => parse(&v).with_context(|| format!("{key}: invalid value `{v}`")),
        }
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// `0=Normal,1=Faulty` keyed by raw label value.
pub fn parse_class_names(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (label, name) = pair
            .split_once('=')
            .with_context(|| format!("CLASS_NAMES entry `{pair}` is not label=name"))?;
        let (label, name) = (label.trim(), name.trim());
        if label.is_empty() || name.is_empty() {
            bail!("CLASS_NAMES entry `{pair}` has an empty side");
        }
        if out.values().any(|n| n == name) {
            bail!("CLASS_NAMES gives more than one label the name `{name}`");
        }
        out.insert(label.to_string(), name.to_string());
    }
    Ok(out)
}
