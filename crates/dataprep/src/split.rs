use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CleanRow;

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("invalid split ratios: {0}")]
    InvalidRatios(String),

    #[error("label `{label}` has {rows} rows, not enough to put one in each of train/val/test")]
    Insufficient { label: String, rows: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl SplitRatios {
    pub fn new(train: f64, val: f64, test: f64) -> Result<Self, SplitError> {
        let r = Self { train, val, test };
        r.validate()?;
        Ok(r)
    }

    pub fn validate(&self) -> Result<(), SplitError> {
        for (name, v) in [("train", self.train), ("val", self.val), ("test", self.test)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(SplitError::InvalidRatios(format!("{name} ratio must be > 0, got {v}")));
            }
        }
        let sum = self.train + self.val + self.test;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(SplitError::InvalidRatios(format!("ratios sum to {sum}, expected 1")));
        }
        Ok(())
    }

    fn as_array(&self) -> [f64; 3] {
        [self.train, self.val, self.test]
    }
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self { train: 0.70, val: 0.15, test: 0.15 }
    }
}

impl FromStr for SplitRatios {
    type Err = SplitError;

    /// `"0.7,0.15,0.15"` or `"70/15/15"`; percentages are scaled down.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(|c: char| c == ',' || c == '/')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| SplitError::InvalidRatios(format!("`{s}`: {e}")))?;
        let &[a, b, c] = parts.as_slice() else {
            return Err(SplitError::InvalidRatios(format!("`{s}`: expected three values")));
        };
        let total = a + b + c;
        if total > 1.0 + 1e-6 && (total - 100.0).abs() < 1e-6 {
            return Self::new(a / 100.0, b / 100.0, c / 100.0);
        }
        Self::new(a, b, c)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Partition {
    Train,
    Val,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Val, Partition::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positions into the input slice, each partition in ascending order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SplitPlan {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl SplitPlan {
    pub fn get(&self, p: Partition) -> &[usize] {
        match p {
            Partition::Train => &self.train,
            Partition::Val => &self.val,
            Partition::Test => &self.test,
        }
    }

    fn get_mut(&mut self, p: Partition) -> &mut Vec<usize> {
        match p {
            Partition::Train => &mut self.train,
            Partition::Val => &mut self.val,
            Partition::Test => &mut self.test,
        }
    }

    pub fn counts(&self) -> SplitCounts {
        SplitCounts {
            train: self.train.len(),
            val: self.val.len(),
            test: self.test.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCounts {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitCounts {
    pub fn total(&self) -> usize {
        self.train + self.val + self.test
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitMetadata {
    pub ratios: SplitRatios,
    pub seed: u64,
    pub stratify_on: String,
    pub counts: SplitCounts,
    /// partition -> label -> rows
    pub label_counts: BTreeMap<String, BTreeMap<String, usize>>,
    /// Fingerprint of the rows that were split.
    pub input_hash: String,
}

/// Per-group row counts for `[train, val, test]`.
///
/// Each partition gets `floor(n * ratio)`; leftover rows go to train, then
/// val, then test. With at least three rows an empty partition takes one row
/// from the largest.
pub fn allocate(n: usize, ratios: &SplitRatios) -> [usize; 3] {
    let mut counts = [0usize; 3];
    for (c, r) in counts.iter_mut().zip(ratios.as_array()) {
        // epsilon keeps 0.15 * 20 from landing on 2.999..
        *c = ((n as f64) * r + 1e-9).floor() as usize;
    }
    let assigned: usize = counts.iter().sum();
    if assigned > n {
        counts[2] -= assigned - n;
    }
    let mut remainder = n.saturating_sub(assigned);
    let mut i = 0;
    while remainder > 0 {
        counts[i % 3] += 1;
        remainder -= 1;
        i += 1;
    }
    if n >= Partition::ALL.len() {
        for i in 0..counts.len() {
            if counts[i] == 0 {
                let donor = (0..counts.len())
                    .max_by_key(|&j| (counts[j], usize::MAX - j))
                    .unwrap_or(0);
                counts[donor] -= 1;
                counts[i] += 1;
            }
        }
    }
    counts
}

/// Stratified split of row positions by label.
///
/// Groups are visited in sorted label order; group `i` is shuffled by a
/// ChaCha8 stream seeded with `seed` on stream `i`, so one label's order never
/// depends on another's size.
pub fn stratified_split<L: AsRef<str>>(
    labels: &[L],
    ratios: &SplitRatios,
    seed: u64,
) -> Result<SplitPlan, SplitError> {
    ratios.validate()?;

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (pos, l) in labels.iter().enumerate() {
        groups.entry(l.as_ref()).or_default().push(pos);
    }

    let mut plan = SplitPlan::default();
    for (stream, (label, mut members)) in groups.into_iter().enumerate() {
        if members.len() < Partition::ALL.len() {
            return Err(SplitError::Insufficient {
                label: label.to_string(),
                rows: members.len(),
            });
        }

        let counts = allocate(members.len(), ratios);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream as u64);
        members.shuffle(&mut rng);

        let mut rest = members.as_slice();
        for (p, n) in Partition::ALL.into_iter().zip(counts) {
            let (head, tail) = rest.split_at(n);
            plan.get_mut(p).extend_from_slice(head);
            rest = tail;
        }
    }

    for p in Partition::ALL {
        plan.get_mut(p).sort_unstable();
    }
    Ok(plan)
}

/// BLAKE3 over source index, label and feature values of every row.
pub fn fingerprint_rows(rows: &[CleanRow]) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in rows {
        hasher.update(&(r.index as u64).to_le_bytes());
        hasher.update(r.label.as_bytes());
        hasher.update(b"\0");
        for v in &r.features {
            hasher.update(&v.to_bits().to_le_bytes());
        }
    }
    hex::encode(hasher.finalize().as_bytes())
}

pub fn split_rows(
    rows: &[CleanRow],
    ratios: &SplitRatios,
    seed: u64,
    stratify_on: &str,
) -> Result<(SplitPlan, SplitMetadata), SplitError> {
    let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
    let plan = stratified_split(&labels, ratios, seed)?;

    let mut label_counts = BTreeMap::new();
    for p in Partition::ALL {
        let mut per_label: BTreeMap<String, usize> = BTreeMap::new();
        for &pos in plan.get(p) {
            *per_label.entry(labels[pos].to_string()).or_default() += 1;
        }
        label_counts.insert(p.as_str().to_string(), per_label);
    }

    let meta = SplitMetadata {
        ratios: *ratios,
        seed,
        stratify_on: stratify_on.to_string(),
        counts: plan.counts(),
        label_counts,
        input_hash: fingerprint_rows(rows),
    };
    Ok((plan, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn labels(normal: usize, faulty: usize) -> Vec<&'static str> {
        let mut v = vec!["Normal"; normal];
        v.extend(vec!["Faulty"; faulty]);
        v
    }

    #[test]
    fn parses_ratios() {
        assert_eq!("0.7,0.15,0.15".parse::<SplitRatios>().unwrap(), SplitRatios::default());
        let pct = "70/15/15".parse::<SplitRatios>().unwrap();
        assert!((pct.train - 0.7).abs() < 1e-12);
        assert!("0.5,0.5".parse::<SplitRatios>().is_err());
        assert!("0.5,0.5,0.5".parse::<SplitRatios>().is_err());
        assert!("1,0,0".parse::<SplitRatios>().is_err());
    }

    #[test]
    fn allocate_hands_remainder_to_train_first() {
        let r = SplitRatios::default();
        assert_eq!(allocate(80, &r), [56, 12, 12]);
        assert_eq!(allocate(20, &r), [14, 3, 3]);
        // 7 * [0.7, 0.15, 0.15] = [4.9, 1.05, 1.05] -> [4, 1, 1] + 1 leftover
        assert_eq!(allocate(7, &r), [5, 1, 1]);
        // 11 -> [7, 1, 1] + 2 leftover
        assert_eq!(allocate(11, &r), [8, 2, 1]);
    }

    #[test]
    fn splits_eighty_twenty_labels() {
        let l = labels(80, 20);
        let r = SplitRatios::default();
        let plan = stratified_split(&l, &r, 42).unwrap();
        assert_eq!(plan.counts(), SplitCounts { train: 70, val: 15, test: 15 });

        let faulty_in_train = plan.train.iter().filter(|&&p| l[p] == "Faulty").count();
        assert_eq!(faulty_in_train, 14);
        let normal_in_train = plan.train.len() - faulty_in_train;
        assert_eq!(normal_in_train, 56);

        assert_eq!(plan, stratified_split(&l, &r, 42).unwrap());

        let other = stratified_split(&l, &r, 7).unwrap();
        assert_ne!(plan, other);
        assert_eq!(plan.counts(), other.counts());
    }

    #[test]
    fn tiny_groups_still_fill_every_partition() {
        let r = SplitRatios::default();
        assert_eq!(allocate(3, &r), [1, 1, 1]);
        assert_eq!(allocate(6, &r), [4, 1, 1]);

        for n in [3, 6] {
            let l = labels(n, n);
            let plan = stratified_split(&l, &r, 42).unwrap();
            for p in Partition::ALL {
                let part = plan.get(p);
                assert!(part.iter().any(|&i| l[i] == "Faulty"), "{p} has no Faulty rows for n={n}");
                assert!(part.iter().any(|&i| l[i] == "Normal"), "{p} has no Normal rows for n={n}");
            }
            assert_eq!(plan.counts().total(), 2 * n);
        }
    }

    #[test]
    fn small_group_is_insufficient() {
        let l = labels(50, 2);
        let err = stratified_split(&l, &SplitRatios::default(), 1).unwrap_err();
        assert_eq!(err, SplitError::Insufficient { label: "Faulty".into(), rows: 2 });
    }

    #[test]
    fn metadata_counts_labels_per_partition() {
        let rows: Vec<CleanRow> = labels(80, 20)
            .into_iter()
            .enumerate()
            .map(|(i, l)| CleanRow { index: i, features: vec![i as f64], label: l.into() })
            .collect();
        let (plan, meta) = split_rows(&rows, &SplitRatios::default(), 42, "label").unwrap();
        assert_eq!(meta.counts, plan.counts());
        assert_eq!(meta.label_counts["train"]["Faulty"], 14);
        assert_eq!(meta.label_counts["test"]["Normal"], 12);
        assert_eq!(meta.stratify_on, "label");
        assert_eq!(meta.input_hash, fingerprint_rows(&rows));
    }

    proptest! {
        #[test]
        fn partitions_are_disjoint_and_exhaustive(
            normal in 3usize..300,
            faulty in 3usize..300,
            seed in any::<u64>(),
        ) {
            let l = labels(normal, faulty);
            let plan = stratified_split(&l, &SplitRatios::default(), seed).unwrap();

            let mut seen = HashSet::new();
            for p in Partition::ALL {
                for &pos in plan.get(p) {
                    prop_assert!(seen.insert(pos), "row {} in more than one partition", pos);
                }
            }
            prop_assert_eq!(seen.len(), l.len());
        }

        #[test]
        fn same_seed_same_partitions(
            normal in 3usize..200,
            faulty in 3usize..200,
            seed in any::<u64>(),
        ) {
            let l = labels(normal, faulty);
            let a = stratified_split(&l, &SplitRatios::default(), seed).unwrap();
            let b = stratified_split(&l, &SplitRatios::default(), seed).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn label_share_is_preserved(
            normal in 100usize..400,
            faulty in 100usize..400,
            seed in any::<u64>(),
        ) {
            let l = labels(normal, faulty);
            let plan = stratified_split(&l, &SplitRatios::default(), seed).unwrap();
            let global = faulty as f64 / l.len() as f64;
            for p in Partition::ALL {
                let part = plan.get(p);
                let faulty_in_part = part.iter().filter(|&&i| l[i] == "Faulty").count();
                let share = faulty_in_part as f64 / part.len() as f64;
                prop_assert!((share - global).abs() <= 0.02, "{} share {} vs {}", p, share, global);
            }
        }
    }
}
