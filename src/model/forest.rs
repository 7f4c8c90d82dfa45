//! Classifier interface and the tree ensemble behind it.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters,
};

use crate::error::{FwError, Result};
use crate::label::FirewallLabel;

/// Fitted model scoring rows of a feature matrix.
pub trait Classifier {
    fn n_features(&self) -> usize;

    /// One row per input row, one column per label in [`FirewallLabel::ALL`]
    /// order. Rows sum to 1.
    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>>;

    fn predict(&self, x: &Array2<f64>) -> Result<Vec<FirewallLabel>> {
        let proba = self.predict_proba(x)?;
        proba
            .outer_iter()
            .map(|row| {
                let (best, _) = argmax(row.iter().copied());
                FirewallLabel::from_index(best)
                    .ok_or_else(|| FwError::Classifier(format!("class index {} out of range", best)))
            })
            .collect()
    }
}

pub trait Estimator {
    type Model: Classifier;

    fn fit(&self, x: &Array2<f64>, y: &[FirewallLabel], seed: u64) -> Result<Self::Model>;
}

/// First index holding the maximum; ties go to the lower label.
pub fn argmax(values: impl Iterator<Item = f64>) -> (usize, f64) {
    values
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    /// Hard cap on tree depth.
    pub max_depth: u16,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features drawn per tree. `None` means ceil(sqrt(n_features)).
    pub max_features: Option<usize>,
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: None,
            bootstrap: true,
        }
    }
}

impl ForestParams {
    fn features_per_tree(&self, n_features: usize) -> usize {
        let k = self
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt().ceil() as usize);
        k.clamp(1, n_features.max(1))
    }

    fn tree_parameters(&self) -> DecisionTreeClassifierParameters {
        DecisionTreeClassifierParameters::default()
            .with_max_depth(self.max_depth)
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf)
    }
}

type Tree = DecisionTreeClassifier<f64, u32, DenseMatrix<f64>, Vec<u32>>;

#[derive(Debug, Serialize, Deserialize)]
enum Member {
    Tree {
        /// Column indices, ascending.
        features: Vec<usize>,
        tree: Tree,
    },
    /// Rows drawn for this member held a single class.
    Constant(u32),
}

impl Member {
    fn predict(&self, x: &Array2<f64>, rows: &[usize]) -> Result<Vec<u32>> {
        match self {
            Member::Tree { features, tree } => tree
                .predict(&dense(x, rows, features))
                .map_err(|e| FwError::Classifier(e.to_string())),
            Member::Constant(class) => Ok(vec![*class; rows.len()]),
        }
    }
}

/// Bagged decision trees over random feature subspaces. Probabilities are
/// vote fractions.
#[derive(Debug, Serialize, Deserialize)]
pub struct TreeEnsemble {
    n_features: usize,
    members: Vec<Member>,
}

fn dense(x: &Array2<f64>, rows: &[usize], columns: &[usize]) -> DenseMatrix<f64> {
    let values: Vec<Vec<f64>> = rows
        .iter()
        .map(|&r| columns.iter().map(|&c| x[[r, c]]).collect())
        .collect();
    DenseMatrix::from_2d_vec(&values)
}

impl Estimator for ForestParams {
    type Model = TreeEnsemble;

    fn fit(&self, x: &Array2<f64>, y: &[FirewallLabel], seed: u64) -> Result<TreeEnsemble> {
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 || n_features == 0 {
            return Err(FwError::InsufficientData("cannot fit on an empty matrix".into()));
        }
        if n_rows != y.len() {
            return Err(FwError::Classifier(format!(
                "{} rows but {} labels",
                n_rows,
                y.len()
            )));
        }
        if self.n_trees == 0 {
            return Err(FwError::Classifier("forest needs at least one tree".into()));
        }

        let k = self.features_per_tree(n_features);
        let parameters = self.tree_parameters();
        let mut members = Vec::with_capacity(self.n_trees);

        for t in 0..self.n_trees {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));

            let mut features = index::sample(&mut rng, n_features, k).into_vec();
            features.sort_unstable();

            let rows: Vec<usize> = if self.bootstrap {
                (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect()
            } else {
                (0..n_rows).collect()
            };
            let targets: Vec<u32> = rows.iter().map(|&r| y[r].index() as u32).collect();

            // smartcore refuses to fit fewer than two classes.
            if targets.iter().all(|&c| c == targets[0]) {
                members.push(Member::Constant(targets[0]));
                continue;
            }
            let tree = Tree::fit(&dense(x, &rows, &features), &targets, parameters.clone())
                .map_err(|e| FwError::Classifier(format!("tree {}: {}", t, e)))?;
            members.push(Member::Tree { features, tree });
        }

        Ok(TreeEnsemble {
            n_features,
            members,
        })
    }
}

impl Classifier for TreeEnsemble {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let n_rows = x.len_of(Axis(0));
        if x.ncols() != self.n_features {
            return Err(FwError::Classifier(format!(
                "model takes {} features, got {}",
                self.n_features,
                x.ncols()
            )));
        }
        let mut votes = Array2::<f64>::zeros((n_rows, FirewallLabel::COUNT));
        if n_rows == 0 {
            return Ok(votes);
        }

        let all_rows: Vec<usize> = (0..n_rows).collect();
        for member in &self.members {
            let predicted = member.predict(x, &all_rows)?;
            for (row, class) in predicted.into_iter().enumerate() {
                let class = class as usize;
                if class >= FirewallLabel::COUNT {
                    return Err(FwError::Classifier(format!("tree voted for class {}", class)));
                }
                votes[[row, class]] += 1.0;
            }
        }
        votes /= self.members.len() as f64;
        Ok(votes)
    }
}
