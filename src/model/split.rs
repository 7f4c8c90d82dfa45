//! Seeded train/test partitions and cross-validation folds.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::label::FirewallLabel;

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

fn indices_by_class(labels: &[FirewallLabel]) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); FirewallLabel::COUNT];
    for (i, label) in labels.iter().enumerate() {
        groups[label.index()].push(i);
    }
    groups
}

/// Rows held out for testing out of `n` at the given train fraction. A class
/// with two or more rows keeps at least one row on each side; a lone row
/// trains.
fn test_share(n: usize, train_ratio: f64) -> usize {
    if n < 2 {
        return 0;
    }
    let ideal = (n as f64 * (1.0 - train_ratio)).round() as usize;
    ideal.clamp(1, n - 1)
}

pub fn stratified_split(labels: &[FirewallLabel], train_ratio: f64, seed: u64) -> Split {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = Split {
        train: Vec::new(),
        test: Vec::new(),
    };
    for mut group in indices_by_class(labels) {
        group.shuffle(&mut rng);
        let n_test = test_share(group.len(), train_ratio);
        split.test.extend_from_slice(&group[..n_test]);
        split.train.extend_from_slice(&group[n_test..]);
    }
    split.train.sort_unstable();
    split.test.sort_unstable();
    split
}

pub fn shuffled_split(n: usize, train_ratio: f64, seed: u64) -> Split {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let n_test = test_share(n, train_ratio);
    let mut split = Split {
        test: order[..n_test].to_vec(),
        train: order[n_test..].to_vec(),
    };
    split.train.sort_unstable();
    split.test.sort_unstable();
    split
}

/// `k` folds, each class dealt round-robin after shuffling. Folds that end up
/// empty (fewer rows than `k`) are dropped.
pub fn stratified_folds(labels: &[FirewallLabel], k: usize, seed: u64) -> Vec<Split> {
    let k = k.max(2).min(labels.len().max(1));
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fold_of = vec![0usize; labels.len()];

    let mut next = 0;
    for mut group in indices_by_class(labels) {
        group.shuffle(&mut rng);
        for i in group {
            fold_of[i] = next % k;
            next += 1;
        }
    }

    (0..k)
        .map(|fold| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&i| fold_of[i] == fold);
            Split { train, test }
        })
        .filter(|s| !s.test.is_empty() && !s.train.is_empty())
        .collect()
}
