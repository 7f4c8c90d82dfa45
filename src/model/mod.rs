pub mod forest;
pub mod metrics;
pub mod split;
pub mod trainer;

pub use forest::{Classifier, Estimator, ForestParams, TreeEnsemble};
pub use metrics::{ClassMetrics, ClassificationMetrics};
pub use trainer::{
    train, train_with, CrossValidation, EvaluationReport, FeatureImportance, LearningCurve, TrainedModel,
};
