//! Gradient-boosted regression trees on logistic loss.
//!
//! Features are pre-binned into at most [`MAX_BINS`] buckets per column so
//! that split search per node is a histogram scan. Leaf values take a single
//! Newton step (`sum(residual) / sum(p * (1 - p))`).

use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{Hyperparameters, ModelOpsError, Result};

pub const MAX_BINS: usize = 64;

const MIN_GAIN: f64 = 1e-12;
const MIN_HESSIAN: f64 = 1e-12;
const LEAF_CLAMP: f64 = 50.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict(&self, x: &[f64]) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf { value } => return *value,
                Node::Split { feature, threshold, left, right } => {
                    i = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], i: usize) -> usize {
            match &nodes[i] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    pub n_features: usize,
    pub init_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Column-major bin indices plus the thresholds that separate them.
/// A value `v` falls in bin `b` when `thresholds[b - 1] < v <= thresholds[b]`.
struct Binned {
    bins: Vec<Vec<u8>>,
    thresholds: Vec<Vec<f64>>,
}

impl Binned {
    fn new(x: &[Vec<f64>], n_features: usize) -> Self {
        let mut bins = Vec::with_capacity(n_features);
        let mut thresholds = Vec::with_capacity(n_features);
        for f in 0..n_features {
            let mut values: Vec<f64> = x.iter().map(|r| r[f]).collect();
            values.sort_by(f64::total_cmp);
            values.dedup();

            let cuts: Vec<f64> = if values.len() <= MAX_BINS {
                values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
            } else {
                let mut cuts: Vec<f64> = (1..MAX_BINS)
                    .map(|j| values[j * values.len() / MAX_BINS])
                    .collect();
                cuts.dedup();
                cuts
            };

            let col = x
                .iter()
                .map(|r| cuts.partition_point(|&c| c < r[f]) as u8)
                .collect();
            bins.push(col);
            thresholds.push(cuts);
        }
        Self { bins, thresholds }
    }
}

struct TreeBuilder<'a> {
    binned: &'a Binned,
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a Hyperparameters,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn leaf_value(&self, idx: &[usize]) -> f64 {
        let g: f64 = idx.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = idx.iter().map(|&i| self.hess[i]).sum();
        (g / h.max(MIN_HESSIAN)).clamp(-LEAF_CLAMP, LEAF_CLAMP)
    }

    /// Best `(feature, bin)` to split after, by squared-residual gain.
    fn best_split(&self, idx: &[usize]) -> Option<(usize, usize)> {
        let n = idx.len() as f64;
        let total: f64 = idx.iter().map(|&i| self.grad[i]).sum();
        let parent = total * total / n;
        let min_leaf = self.params.min_samples_leaf.max(1);

        let mut best: Option<(f64, usize, usize)> = None;
        for (f, cuts) in self.binned.thresholds.iter().enumerate() {
            let n_bins = cuts.len() + 1;
            if n_bins < 2 {
                continue;
            }
            let mut sum = vec![0.0f64; n_bins];
            let mut cnt = vec![0usize; n_bins];
            for &i in idx {
                let b = self.binned.bins[f][i] as usize;
                sum[b] += self.grad[i];
                cnt[b] += 1;
            }

            let (mut left_sum, mut left_cnt) = (0.0, 0usize);
            for b in 0..n_bins - 1 {
                left_sum += sum[b];
                left_cnt += cnt[b];
                let right_cnt = idx.len() - left_cnt;
                if left_cnt < min_leaf || right_cnt < min_leaf || cnt[b] == 0 {
                    continue;
                }
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / left_cnt as f64
                    + right_sum * right_sum / right_cnt as f64
                    - parent;
                if gain > MIN_GAIN && best.map_or(true, |(g, _, _)| gain > g) {
                    best = Some((gain, f, b));
                }
            }
        }
        best.map(|(_, f, b)| (f, b))
    }

    fn grow(&mut self, idx: Vec<usize>, depth: usize) -> usize {
        let at = self.nodes.len();
        self.nodes.push(Node::Leaf { value: self.leaf_value(&idx) });

        if depth >= self.params.max_depth || idx.len() < 2 * self.params.min_samples_leaf.max(1) {
            return at;
        }
        let Some((feature, bin)) = self.best_split(&idx) else {
            return at;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = idx
            .into_iter()
            .partition(|&i| (self.binned.bins[feature][i] as usize) <= bin);
        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);
        self.nodes[at] = Node::Split {
            feature,
            threshold: self.binned.thresholds[feature][bin],
            left,
            right,
        };
        at
    }
}

impl GradientBoostedTrees {
    /// Fits on rows `x` with binary labels `y` (0 or 1). Deterministic for a
    /// given `seed`.
    pub fn fit(x: &[Vec<f64>], y: &[u8], params: &Hyperparameters, seed: u64) -> Result<Self> {
        validate_params(params)?;
        if x.is_empty() || x.len() != y.len() {
            return Err(ModelOpsError::Dataset(format!(
                "need matching non-empty rows and labels, got {} and {}",
                x.len(),
                y.len()
            )));
        }
        let n_features = x[0].len();
        if n_features == 0 || x.iter().any(|r| r.len() != n_features) {
            return Err(ModelOpsError::Dataset("rows must share a non-zero feature count".into()));
        }

        let n = x.len();
        let pos = y.iter().filter(|&&v| v == 1).count() as f64;
        let p0 = (pos / n as f64).clamp(1e-6, 1.0 - 1e-6);
        let init_score = (p0 / (1.0 - p0)).ln();

        let binned = Binned::new(x, n_features);
        let mut score = vec![init_score; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let sample_size = ((n as f64 * params.subsample).round() as usize).clamp(1, n);

        let mut trees = Vec::with_capacity(params.n_estimators);
        for _ in 0..params.n_estimators {
            for i in 0..n {
                let p = sigmoid(score[i]);
                grad[i] = f64::from(y[i]) - p;
                hess[i] = p * (1.0 - p);
            }

            let idx: Vec<usize> = if sample_size < n {
                let mut v = index::sample(&mut rng, n, sample_size).into_vec();
                v.sort_unstable();
                v
            } else {
                (0..n).collect()
            };

            let mut builder = TreeBuilder {
                binned: &binned,
                grad: &grad,
                hess: &hess,
                params,
                nodes: Vec::new(),
            };
            builder.grow(idx, 0);
            let tree = RegressionTree { nodes: builder.nodes };

            for (s, row) in score.iter_mut().zip(x) {
                *s += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        Ok(Self {
            n_features,
            init_score,
            learning_rate: params.learning_rate,
            trees,
        })
    }

    pub fn decision_function(&self, x: &[f64]) -> f64 {
        self.init_score + self.learning_rate * self.trees.iter().map(|t| t.predict(x)).sum::<f64>()
    }

    /// Probability of the positive class.
    pub fn predict_proba(&self, x: &[f64]) -> f64 {
        sigmoid(self.decision_function(x))
    }

    pub fn predict(&self, x: &[f64]) -> u8 {
        u8::from(self.predict_proba(x) >= 0.5)
    }
}

pub fn validate_params(p: &Hyperparameters) -> Result<()> {
    if p.n_estimators == 0 {
        return Err(ModelOpsError::Config("n_estimators must be at least 1".into()));
    }
    if !(p.learning_rate > 0.0 && p.learning_rate.is_finite()) {
        return Err(ModelOpsError::Config(format!(
            "learning_rate must be > 0, got {}",
            p.learning_rate
        )));
    }
    if p.max_depth == 0 {
        return Err(ModelOpsError::Config("max_depth must be at least 1".into()));
    }
    if !(p.subsample > 0.0 && p.subsample <= 1.0) {
        return Err(ModelOpsError::Config(format!(
            "subsample must be in (0, 1], got {}",
            p.subsample
        )));
    }
    Ok(())
}
