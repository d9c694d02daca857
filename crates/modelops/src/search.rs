use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::metrics::{evaluate, mean_std};
use crate::{
    CvScore, Dataset, GradientBoostedTrees, Hyperparameters, ModelOpsError, Result, TargetMetric,
};

/// Inclusive bounds for each hyperparameter. `learning_rate` is sampled
/// log-uniformly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub n_estimators: (usize, usize),
    pub learning_rate: (f64, f64),
    pub max_depth: (usize, usize),
    pub min_samples_leaf: (usize, usize),
    pub subsample: (f64, f64),
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            n_estimators: (50, 300),
            learning_rate: (0.01, 0.3),
            max_depth: (2, 5),
            min_samples_leaf: (1, 20),
            subsample: (0.6, 1.0),
        }
    }
}

impl SearchSpace {
    pub fn validate(&self) -> Result<()> {
        let ok = self.n_estimators.0 >= 1
            && self.n_estimators.0 <= self.n_estimators.1
            && self.learning_rate.0 > 0.0
            && self.learning_rate.0 <= self.learning_rate.1
            && self.max_depth.0 >= 1
            && self.max_depth.0 <= self.max_depth.1
            && self.min_samples_leaf.0 >= 1
            && self.min_samples_leaf.0 <= self.min_samples_leaf.1
            && self.subsample.0 > 0.0
            && self.subsample.0 <= self.subsample.1
            && self.subsample.1 <= 1.0;
        if ok {
            Ok(())
        } else {
            Err(ModelOpsError::Config(format!("invalid search space {self:?}")))
        }
    }

    pub fn contains(&self, p: &Hyperparameters) -> bool {
        (self.n_estimators.0..=self.n_estimators.1).contains(&p.n_estimators)
            && p.learning_rate >= self.learning_rate.0
            && p.learning_rate <= self.learning_rate.1
            && (self.max_depth.0..=self.max_depth.1).contains(&p.max_depth)
            && (self.min_samples_leaf.0..=self.min_samples_leaf.1).contains(&p.min_samples_leaf)
            && p.subsample >= self.subsample.0
            && p.subsample <= self.subsample.1
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub params: Hyperparameters,
    pub score: CvScore,
    pub fold_scores: Vec<f64>,
}

/// Proposes the next configuration to evaluate. Implementations may use the
/// trial history; the trainer only asks and scores.
pub trait Searcher {
    fn name(&self) -> &str;
    fn suggest(&mut self, space: &SearchSpace, history: &[Trial]) -> Hyperparameters;
}

pub struct RandomSearch {
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed) }
    }
}

impl Searcher for RandomSearch {
    fn name(&self) -> &str {
        "random"
    }

    fn suggest(&mut self, space: &SearchSpace, _history: &[Trial]) -> Hyperparameters {
        let (lo, hi) = space.learning_rate;
        let learning_rate = (self.rng.gen_range(lo.ln()..=hi.ln())).exp().clamp(lo, hi);
        Hyperparameters {
            n_estimators: self.rng.gen_range(space.n_estimators.0..=space.n_estimators.1),
            learning_rate,
            max_depth: self.rng.gen_range(space.max_depth.0..=space.max_depth.1),
            min_samples_leaf: self
                .rng
                .gen_range(space.min_samples_leaf.0..=space.min_samples_leaf.1),
            subsample: self.rng.gen_range(space.subsample.0..=space.subsample.1),
        }
    }
}

/// Fold id per row, stratified by label: each class is shuffled and dealt
/// round-robin across `k` folds.
pub fn stratified_folds(labels: &[u8], k: usize, seed: u64) -> Result<Vec<usize>> {
    if k < 2 {
        return Err(ModelOpsError::Config(format!("cv_folds must be at least 2, got {k}")));
    }
    let mut folds = vec![0usize; labels.len()];
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        if members.len() < k {
            return Err(ModelOpsError::Dataset(format!(
                "class {class} has {} rows, fewer than {k} folds",
                members.len()
            )));
        }
        members.shuffle(&mut rng);
        for (j, &i) in members.iter().enumerate() {
            folds[i] = j % k;
        }
    }
    Ok(folds)
}

/// Mean and spread of `target` over `k` stratified folds of `data`.
pub fn cross_validate(
    data: &Dataset,
    params: &Hyperparameters,
    k: usize,
    target: TargetMetric,
    seed: u64,
) -> Result<(CvScore, Vec<f64>)> {
    let folds = stratified_folds(&data.labels, k, seed)?;
    let mut scores = Vec::with_capacity(k);
    for fold in 0..k {
        let (train_idx, hold_idx): (Vec<usize>, Vec<usize>) =
            (0..data.len()).partition(|&i| folds[i] != fold);
        let train = data.subset(&train_idx);
        let hold = data.subset(&hold_idx);

        let model = GradientBoostedTrees::fit(&train.rows, &train.labels, params, seed)?;
        let predicted: Vec<u8> = hold.rows.iter().map(|r| model.predict(r)).collect();
        scores.push(evaluate(&hold.labels, &predicted).score(target));
    }
    let (mean, std) = mean_std(&scores);
    Ok((CvScore { mean, std }, scores))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_search_stays_in_space_and_is_seeded() {
        let space = SearchSpace::default();
        let mut a = RandomSearch::new(5);
        let mut b = RandomSearch::new(5);
        for _ in 0..50 {
            let p = a.suggest(&space, &[]);
            assert!(space.contains(&p), "{p:?}");
            assert_eq!(p, b.suggest(&space, &[]));
        }
    }

    #[test]
    fn folds_are_stratified() {
        let labels: Vec<u8> = (0..100).map(|i| u8::from(i % 5 == 0)).collect();
        let folds = stratified_folds(&labels, 5, 3).unwrap();
        for f in 0..5 {
            let members: Vec<usize> = (0..100).filter(|&i| folds[i] == f).collect();
            assert_eq!(members.len(), 20);
            assert_eq!(members.iter().filter(|&&i| labels[i] == 1).count(), 4);
        }
    }

    #[test]
    fn too_few_positives_for_folds() {
        let labels = vec![0, 0, 0, 0, 0, 1, 1];
        assert!(matches!(stratified_folds(&labels, 3, 0), Err(ModelOpsError::Dataset(_))));
    }

    #[test]
    fn invalid_space_is_refused() {
        let space = SearchSpace { max_depth: (4, 2), ..Default::default() };
        assert!(space.validate().is_err());
        assert!(SearchSpace::default().validate().is_ok());
    }
}
