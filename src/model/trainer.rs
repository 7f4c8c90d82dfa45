
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use super::forest::{Classifier, Estimator, TreeEnsemble};
use super::metrics::{accuracy, ClassificationMetrics};
use super::split::{shuffled_split, stratified_folds, stratified_split, Split};
use crate::config::TrainingSettings;
use crate::dataset::Dataset;
use crate::error::{FwError, Result};
use crate::features::{feature_names, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::label::FirewallLabel;

/// Fitted classifier plus the feature order it was fitted on.
#[derive(Debug, Serialize, Deserialize)]
pub struct TrainedModel<C = TreeEnsemble> {
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    pub label_counts: [usize; FirewallLabel::COUNT],
    pub classifier: C,
}

impl<C: Classifier> TrainedModel<C> {
    /// Fails unless `live` lists the same features in the same order.
    pub fn check_schema(&self, live: &[String]) -> Result<()> {
        if self.feature_names.as_slice() != live {
            return Err(FwError::SchemaMismatch {
                expected: self.feature_names.clone(),
                found: live.to_vec(),
            });
        }
        Ok(())
    }

    pub fn predict_proba(&self, vectors: &[FeatureVector]) -> Result<Array2<f64>> {
        self.classifier.predict_proba(&to_matrix(vectors))
    }

    pub fn predict(&self, vectors: &[FeatureVector]) -> Result<Vec<FirewallLabel>> {
        self.classifier.predict(&to_matrix(vectors))
    }
}

impl<C: Serialize> TrainedModel<C> {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self, false)
    }
}

impl<C: DeserializeOwned> TrainedModel<C> {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FwError::ModelNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn to_matrix(vectors: &[FeatureVector]) -> Array2<f64> {
    let mut matrix = Array2::zeros((vectors.len(), FEATURE_COUNT));
    for (mut row, vector) in matrix.outer_iter_mut().zip(vectors) {
        for (cell, value) in row.iter_mut().zip(vector.to_array()) {
            *cell = value;
        }
    }
    matrix
}

fn write_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    fs::write(path, json)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub folds: usize,
    pub scores: Vec<f64>,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl CrossValidation {
    fn from_scores(scores: Vec<f64>) -> Self {
        let (mean, std, min, max) = if scores.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            (
                scores.iter().mean(),
                scores.iter().population_std_dev(),
                Statistics::min(scores.iter()),
                Statistics::max(scores.iter()),
            )
        };
        Self {
            folds: scores.len(),
            scores,
            mean,
            std,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningCurve {
    pub train_sizes: Vec<usize>,
    /// Accuracy on the rows each model was fitted on, averaged over folds.
    pub train_scores: Vec<f64>,
    /// Accuracy on the held-out fold, averaged over folds.
    pub test_scores: Vec<f64>,
    /// Last train score minus last test score. Large values mean memorization.
    pub generalization_gap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    /// Mean drop in held-out accuracy when the column is shuffled.
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub trained_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    pub train_samples: usize,
    pub test_samples: usize,
    pub test: ClassificationMetrics,
    pub cross_validation: CrossValidation,
    pub learning_curve: LearningCurve,
    pub feature_importance: Vec<FeatureImportance>,
}

impl EvaluationReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self, true)
    }

    /// Most important first.
    pub fn ranked_importance(&self) -> Vec<&FeatureImportance> {
        let mut ranked: Vec<&FeatureImportance> = self.feature_importance.iter().collect();
        ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        ranked
    }
}

pub fn train(dataset: &Dataset, settings: &TrainingSettings) -> Result<(TrainedModel, EvaluationReport)> {
    train_with(dataset, settings, &settings.forest)
}

pub fn train_with<E: Estimator>(
    dataset: &Dataset,
    settings: &TrainingSettings,
    estimator: &E,
) -> Result<(TrainedModel<E::Model>, EvaluationReport)> {
    let labeled = dataset.labeled();
    if labeled.len() < dataset.len() {
        warn!(
            "ignoring {} unlabeled row(s) out of {}",
            dataset.len() - labeled.len(),
            dataset.len()
        );
    }
    if labeled.len() < 2 {
        return Err(FwError::InsufficientData(format!(
            "need at least 2 labeled rows, have {}",
            labeled.len()
        )));
    }

    let x = labeled.feature_matrix();
    let y: Vec<FirewallLabel> = labeled.iter().filter_map(|s| s.label).collect();
    info!("training on {} rows, label counts {:?}", y.len(), labeled.label_counts());

    let split = if settings.stratify {
        stratified_split(&y, settings.split_ratio, settings.seed)
    } else {
        shuffled_split(y.len(), settings.split_ratio, settings.seed)
    };
    if split.test.is_empty() || split.train.is_empty() {
        return Err(FwError::InsufficientData(format!(
            "split of {} rows at ratio {} leaves an empty partition",
            y.len(),
            settings.split_ratio
        )));
    }

    let (x_train, y_train) = subset(&x, &y, &split.train);
    let (x_test, y_test) = subset(&x, &y, &split.test);
    let model = estimator.fit(&x_train, &y_train, settings.seed)?;
    let test = ClassificationMetrics::compute(&y_test, &model.predict(&x_test)?);
    info!("held-out accuracy {:.4} on {} rows", test.accuracy, y_test.len());
    let feature_importance = permutation_importance(&model, &x_test, &y_test, settings.seed)?;

    let folds = stratified_folds(&y, settings.cv_folds, settings.seed);
    let cross_validation = cross_validate(estimator, &x, &y, &folds, settings.seed)?;
    info!(
        "{}-fold cross-validation: mean {:.4}, std {:.4}",
        cross_validation.folds, cross_validation.mean, cross_validation.std
    );

    let learning_curve = learning_curve(
        estimator,
        &x,
        &y,
        &folds,
        settings.learning_curve_points,
        settings.seed,
    )?;
    debug!("learning curve {:?}", learning_curve);

    let trained_at = Utc::now();
    let names = feature_names();
    let report = EvaluationReport {
        trained_at,
        feature_names: names.clone(),
        train_samples: split.train.len(),
        test_samples: split.test.len(),
        test,
        cross_validation,
        learning_curve,
        feature_importance,
    };
    let trained = TrainedModel {
        feature_names: names,
        trained_at,
        training_samples: y_train.len(),
        label_counts: labeled.label_counts(),
        classifier: model,
    };
    Ok((trained, report))
}

fn subset(x: &Array2<f64>, y: &[FirewallLabel], rows: &[usize]) -> (Array2<f64>, Vec<FirewallLabel>) {
    (x.select(Axis(0), rows), rows.iter().map(|&i| y[i]).collect())
}

fn cross_validate<E: Estimator>(
    estimator: &E,
    x: &Array2<f64>,
    y: &[FirewallLabel],
    folds: &[Split],
    seed: u64,
) -> Result<CrossValidation> {
    let mut scores = Vec::with_capacity(folds.len());
    for (i, fold) in folds.iter().enumerate() {
        let (x_train, y_train) = subset(x, y, &fold.train);
        let (x_test, y_test) = subset(x, y, &fold.test);
        let model = estimator.fit(&x_train, &y_train, seed.wrapping_add(i as u64 + 1))?;
        scores.push(accuracy(&y_test, &model.predict(&x_test)?));
    }
    Ok(CrossValidation::from_scores(scores))
}

const IMPORTANCE_REPEATS: usize = 5;

fn permutation_importance<C: Classifier>(
    model: &C,
    x: &Array2<f64>,
    y: &[FirewallLabel],
    seed: u64,
) -> Result<Vec<FeatureImportance>> {
    let baseline = accuracy(y, &model.predict(x)?);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..x.nrows()).collect();

    FEATURE_NAMES
        .iter()
        .enumerate()
        .map(|(column, name)| -> Result<FeatureImportance> {
            let mut drops = Vec::with_capacity(IMPORTANCE_REPEATS);
            for _ in 0..IMPORTANCE_REPEATS {
                order.shuffle(&mut rng);
                let mut shuffled = x.clone();
                for (row, &source) in order.iter().enumerate() {
                    shuffled[[row, column]] = x[[source, column]];
                }
                drops.push(baseline - accuracy(y, &model.predict(&shuffled)?));
            }
            Ok(FeatureImportance {
                feature: name.to_string(),
                importance: drops.iter().mean(),
            })
        })
        .collect()
}

/// Training-set sizes spread evenly from 10% to 100% of the smallest fold's
/// training partition.
fn curve_sizes(max_size: usize, points: usize) -> Vec<usize> {
    let points = points.max(1);
    let mut sizes: Vec<usize> = (0..points)
        .map(|i| {
            let fraction = if points == 1 {
                1.0
            } else {
                0.1 + 0.9 * i as f64 / (points - 1) as f64
            };
            ((fraction * max_size as f64).round() as usize).clamp(1, max_size)
        })
        .collect();
    sizes.dedup();
    sizes
}

fn learning_curve<E: Estimator>(
    estimator: &E,
    x: &Array2<f64>,
    y: &[FirewallLabel],
    folds: &[Split],
    points: usize,
    seed: u64,
) -> Result<LearningCurve> {
    let smallest = folds.iter().map(|f| f.train.len()).min().unwrap_or(0);
    if smallest == 0 {
        return Ok(LearningCurve {
            train_sizes: Vec::new(),
            train_scores: Vec::new(),
            test_scores: Vec::new(),
            generalization_gap: 0.0,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let orders: Vec<Vec<usize>> = folds
        .iter()
        .map(|fold| {
            let mut order = fold.train.clone();
            order.shuffle(&mut rng);
            order
        })
        .collect();

    let train_sizes = curve_sizes(smallest, points);
    let mut train_scores = Vec::with_capacity(train_sizes.len());
    let mut test_scores = Vec::with_capacity(train_sizes.len());

    for &size in &train_sizes {
        let mut train_acc = Vec::with_capacity(folds.len());
        let mut test_acc = Vec::with_capacity(folds.len());
        for (i, (fold, order)) in folds.iter().zip(&orders).enumerate() {
            let (x_train, y_train) = subset(x, y, &order[..size]);
            let (x_test, y_test) = subset(x, y, &fold.test);
            let model = estimator.fit(&x_train, &y_train, seed.wrapping_add(i as u64 + 1))?;
            train_acc.push(accuracy(&y_train, &model.predict(&x_train)?));
            test_acc.push(accuracy(&y_test, &model.predict(&x_test)?));
        }
        train_scores.push(train_acc.iter().mean());
        test_scores.push(test_acc.iter().mean());
    }

    let generalization_gap = match (train_scores.last(), test_scores.last()) {
        (Some(train), Some(test)) => train - test,
        _ => 0.0,
    };
    Ok(LearningCurve {
        train_sizes,
        train_scores,
        test_scores,
        generalization_gap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::LabeledSample;
    use crate::model::forest::ForestParams;
    use tempfile::TempDir;

    fn vector_for(label: FirewallLabel, jitter: f64) -> FeatureVector {
        let base = FeatureVector {
            avg_latency: 0.5 + jitter,
            packet_loss: 0.0,
            ttl_return: 64,
            icmp_reachable: true,
            filtered_ports_count: 0,
            scan_time: 1.0 + jitter,
            syn_ack_ratio: 1.0,
            tcp_reset_ratio: 1.0,
            response_time: 3.0 + jitter,
            header_modified: false,
        };
        match label {
            FirewallLabel::NoFirewall => base,
            FirewallLabel::Stateless => FeatureVector {
                filtered_ports_count: 40,
                tcp_reset_ratio: 0.0,
                ..base
            },
            FirewallLabel::Stateful => FeatureVector {
                filtered_ports_count: 1000,
                icmp_reachable: false,
                syn_ack_ratio: 0.0,
                tcp_reset_ratio: 0.0,
                scan_time: 30.0 + jitter,
                ..base
            },
            FirewallLabel::Proxy => FeatureVector {
                header_modified: true,
                response_time: 40.0 + jitter,
                ..base
            },
        }
    }

    fn dataset(per_class: usize) -> Dataset {
        let mut samples = Vec::new();
        for i in 0..per_class {
            for label in FirewallLabel::ALL {
                let host = format!("10.0.{}.{}", label.index(), i + 1);
                samples.push(LabeledSample::new(
                    host.parse().unwrap(),
                    vector_for(label, i as f64 * 0.01),
                    Some(label),
                ));
            }
        }
        Dataset::from_samples(samples)
    }

    fn quick() -> TrainingSettings {
        TrainingSettings {
            forest: ForestParams {
                n_trees: 15,
                ..ForestParams::default()
            },
            ..TrainingSettings::default()
        }
    }

    #[test]
    fn test_train_produces_every_evaluation_artifact() {
        let (model, report) = train(&dataset(10), &quick()).unwrap();
        assert_eq!(model.feature_names, feature_names());
        assert_eq!(report.train_samples + report.test_samples, 40);
        assert_eq!(report.test_samples, 8);
        assert_eq!(report.cross_validation.folds, 5);
        assert!(!report.learning_curve.train_sizes.is_empty());
        assert_eq!(
            report.learning_curve.train_sizes.len(),
            report.learning_curve.test_scores.len()
        );
        assert!(report.test.accuracy > 0.9);
    }

    #[test]
    fn test_importance_covers_every_feature() {
        let (_, report) = train(&dataset(10), &quick()).unwrap();
        let names: Vec<&str> = report
            .feature_importance
            .iter()
            .map(|f| f.feature.as_str())
            .collect();
        assert_eq!(names, FEATURE_NAMES.to_vec());
        // Constant across every row, so shuffling it changes nothing.
        let loss = &report.feature_importance[1];
        assert_eq!(loss.feature, "packet_loss");
        assert_eq!(loss.importance, 0.0);

        let ranked = report.ranked_importance();
        assert_eq!(ranked.len(), FEATURE_COUNT);
        assert!(ranked.windows(2).all(|w| w[0].importance >= w[1].importance));
    }

    #[test]
    fn test_single_class_dataset_trains() {
        let samples: Vec<LabeledSample> = (0..4)
            .map(|i| {
                LabeledSample::new(
                    format!("10.0.0.{}", i + 1).parse().unwrap(),
                    vector_for(FirewallLabel::NoFirewall, i as f64 * 0.01),
                    Some(FirewallLabel::NoFirewall),
                )
            })
            .collect();
        let (model, report) = train(&Dataset::from_samples(samples), &quick()).unwrap();
        assert_eq!(report.test.accuracy, 1.0);
        assert_eq!(report.cross_validation.mean, 1.0);
        let unseen = vector_for(FirewallLabel::NoFirewall, 0.5);
        assert_eq!(model.predict(&[unseen]).unwrap(), vec![FirewallLabel::NoFirewall]);
    }

    #[test]
    fn test_too_few_rows_is_insufficient() {
        let one = Dataset::from_samples(dataset(1).into_samples().into_iter().take(1).collect());
        assert!(matches!(train(&one, &quick()), Err(FwError::InsufficientData(_))));
    }

    #[test]
    fn test_unlabeled_rows_are_skipped() {
        let mut data = dataset(5);
        data.push(LabeledSample::new(
            "10.9.9.9".parse().unwrap(),
            vector_for(FirewallLabel::Proxy, 0.0),
            None,
        ));
        let (model, _) = train(&data, &quick()).unwrap();
        assert_eq!(model.label_counts, [5, 5, 5, 5]);
    }

    #[test]
    fn test_schema_check() {
        let (model, _) = train(&dataset(5), &quick()).unwrap();
        assert!(model.check_schema(&feature_names()).is_ok());
        let mut swapped = feature_names();
        swapped.swap(0, 1);
        assert!(matches!(
            model.check_schema(&swapped),
            Err(FwError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_model_and_report_persist() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("models").join("m.json");
        let report_path = dir.path().join("results").join("metrics.json");
        let data = dataset(5);
        let (model, report) = train(&data, &quick()).unwrap();
        model.save(&model_path).unwrap();
        report.save(&report_path).unwrap();

        let loaded: TrainedModel = TrainedModel::load(&model_path).unwrap();
        let vectors: Vec<FeatureVector> = data.iter().map(|s| s.features).collect();
        assert_eq!(loaded.predict(&vectors).unwrap(), model.predict(&vectors).unwrap());
        let restored: EvaluationReport =
            serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(restored, report);
    }

    #[test]
    fn test_missing_model_is_not_found() {
        let result: Result<TrainedModel> = TrainedModel::load(Path::new("/nonexistent/m.json"));
        assert!(matches!(result, Err(FwError::ModelNotFound(_))));
    }

    #[test]
    fn test_curve_sizes() {
        assert_eq!(curve_sizes(100, 10), vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(curve_sizes(3, 10), vec![1, 2, 3]);
        assert_eq!(curve_sizes(7, 1), vec![7]);
    }
}
