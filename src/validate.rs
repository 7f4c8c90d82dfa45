//! Scoring a trained model against a pre-collected dataset.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classify::predict_vectors;
use crate::dataset::{Dataset, LabeledSample};
use crate::error::{FwError, Result};
use crate::features::{feature_names, FeatureVector};
use crate::label::FirewallLabel;
use crate::model::forest::Classifier;
use crate::model::{ClassificationMetrics, TrainedModel};

/// What to do with a dataset where only some rows carry a label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedLabelPolicy {
    /// Predict every row, as if none were labeled.
    #[default]
    TreatAsUnlabeled,
    /// Score the labeled rows only.
    EvaluateLabeled,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Misclassification {
    pub row: usize,
    pub target: IpAddr,
    pub predicted: FirewallLabel,
    pub actual: FirewallLabel,
    pub confidence: f64,
    pub features: FeatureVector,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub metrics: ClassificationMetrics,
    pub misclassified: Vec<Misclassification>,
    /// Unlabeled rows left out under `EvaluateLabeled`.
    pub skipped_unlabeled: usize,
}

#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Evaluated(ValidationReport),
    /// Input rows in order, each labeled with its prediction.
    Predicted(Dataset),
}

pub fn validate<C: Classifier>(
    dataset: &Dataset,
    model: &TrainedModel<C>,
    policy: MixedLabelPolicy,
) -> Result<ValidationOutcome> {
    model.check_schema(&feature_names())?;

    let labeled = dataset.labeled_count();
    let evaluate = if dataset.is_empty() || labeled == 0 {
        false
    } else if labeled == dataset.len() {
        true
    } else {
        warn!(
            "{} of {} rows are labeled, applying {:?}",
            labeled,
            dataset.len(),
            policy
        );
        match policy {
            MixedLabelPolicy::TreatAsUnlabeled => false,
            MixedLabelPolicy::EvaluateLabeled => true,
            MixedLabelPolicy::Reject => {
                let row = dataset
                    .iter()
                    .position(|s| s.label.is_none())
                    .map_or(0, |i| i + 1);
                return Err(FwError::DatasetIntegrity {
                    row,
                    reason: "dataset mixes labeled and unlabeled rows".into(),
                });
            }
        }
    };

    if evaluate {
        evaluate_labeled(dataset, model).map(ValidationOutcome::Evaluated)
    } else {
        predict_all(dataset, model).map(ValidationOutcome::Predicted)
    }
}

fn evaluate_labeled<C: Classifier>(dataset: &Dataset, model: &TrainedModel<C>) -> Result<ValidationReport> {
    let rows: Vec<(usize, &LabeledSample, FirewallLabel)> = dataset
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.label.map(|label| (i + 1, s, label)))
        .collect();
    let vectors: Vec<FeatureVector> = rows.iter().map(|(_, s, _)| s.features).collect();
    let predictions = predict_vectors(model, &vectors)?;

    let truth: Vec<FirewallLabel> = rows.iter().map(|(_, _, label)| *label).collect();
    let predicted: Vec<FirewallLabel> = predictions.iter().map(|p| p.label).collect();
    let metrics = ClassificationMetrics::compute(&truth, &predicted);

    let misclassified: Vec<Misclassification> = rows
        .iter()
        .zip(&predictions)
        .filter(|((_, _, actual), prediction)| prediction.label != *actual)
        .map(|((row, sample, actual), prediction)| Misclassification {
            row: *row,
            target: sample.target,
            predicted: prediction.label,
            actual: *actual,
            confidence: prediction.confidence,
            features: sample.features,
        })
        .collect();

    info!(
        "validation accuracy {:.4} over {} rows, {} misclassified",
        metrics.accuracy,
        rows.len(),
        misclassified.len()
    );
    Ok(ValidationReport {
        metrics,
        misclassified,
        skipped_unlabeled: dataset.len() - rows.len(),
    })
}

fn predict_all<C: Classifier>(dataset: &Dataset, model: &TrainedModel<C>) -> Result<Dataset> {
    let vectors: Vec<FeatureVector> = dataset.iter().map(|s| s.features).collect();
    let predictions = predict_vectors(model, &vectors)?;
    let samples = dataset
        .iter()
        .zip(predictions)
        .map(|(sample, prediction)| LabeledSample {
            label: Some(prediction.label),
            ..sample.clone()
        })
        .collect();
    info!("predicted labels for {} unlabeled rows", dataset.len());
    Ok(Dataset::from_samples(samples))
}

/// `data/new.csv` -> `data/new_predictions.csv`.
pub fn predictions_path(dataset_path: &Path) -> PathBuf {
    let stem = dataset_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    dataset_path.with_file_name(format!("{}_predictions.csv", stem))
}
