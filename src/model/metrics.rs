use serde::{Deserialize, Serialize};

use crate::label::FirewallLabel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: FirewallLabel,
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    /// Support-weighted averages over classes.
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub per_class: Vec<ClassMetrics>,
    /// Rows are true labels, columns predicted, both in label order.
    pub confusion_matrix: Vec<Vec<usize>>,
    pub samples: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub fn accuracy(truth: &[FirewallLabel], predicted: &[FirewallLabel]) -> f64 {
    let correct = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
    ratio(correct, truth.len().min(predicted.len()))
}

pub fn confusion_matrix(truth: &[FirewallLabel], predicted: &[FirewallLabel]) -> Vec<Vec<usize>> {
    let mut matrix = vec![vec![0; FirewallLabel::COUNT]; FirewallLabel::COUNT];
    for (t, p) in truth.iter().zip(predicted) {
        matrix[t.index()][p.index()] += 1;
    }
    matrix
}

impl ClassificationMetrics {
    /// Undefined ratios (no predictions or no support for a class) count as 0.
    pub fn compute(truth: &[FirewallLabel], predicted: &[FirewallLabel]) -> Self {
        let matrix = confusion_matrix(truth, predicted);
        let total: usize = matrix.iter().flatten().sum();

        let per_class: Vec<ClassMetrics> = FirewallLabel::ALL
            .iter()
            .map(|&label| {
                let i = label.index();
                let tp = matrix[i][i];
                let support: usize = matrix[i].iter().sum();
                let predicted_as: usize = matrix.iter().map(|row| row[i]).sum();
                let precision = ratio(tp, predicted_as);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label,
                    name: label.name().to_string(),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let weighted = |value: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                return 0.0;
            }
            per_class
                .iter()
                .map(|c| value(c) * c.support as f64)
                .sum::<f64>()
                / total as f64
        };

        Self {
            accuracy: accuracy(truth, predicted),
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1: weighted(|c| c.f1),
            per_class,
            confusion_matrix: matrix,
            samples: total,
        }
    }
}
