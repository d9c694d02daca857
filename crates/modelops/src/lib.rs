pub mod schema;
pub mod manifest;
pub mod store;
pub mod dataset;
pub mod gbm;
pub mod metrics;
pub mod search;
pub mod trainer;
pub mod predictor;

pub use schema::*;
pub use manifest::*;
pub use store::*;
pub use dataset::{load_processed, load_split, Dataset, TrainingData};
pub use gbm::GradientBoostedTrees;
pub use search::{cross_validate, stratified_folds, RandomSearch, SearchSpace, Searcher, Trial};
pub use trainer::{train, TrainConfig, TrainingOutcome};
pub use predictor::{PredictError, PredictRequest, Prediction, Predictor};
