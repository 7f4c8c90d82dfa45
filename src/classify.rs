//! Live classification of targets against a trained model.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{FwError, Result};
use crate::features::{FeatureExtractor, FeatureVector};
use crate::label::FirewallLabel;
use crate::model::forest::{argmax, Classifier};
use crate::model::TrainedModel;
use crate::probe::{ProbeAdapter, ProbeFailure};

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub label: FirewallLabel,
    /// Probability of `label`, 0..1.
    pub confidence: f64,
    /// One entry per label in label order.
    pub probabilities: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub target: IpAddr,
    pub label: FirewallLabel,
    pub confidence: f64,
    pub probabilities: Vec<f64>,
    pub features: FeatureVector,
    pub failed_probes: Vec<ProbeFailure>,
}

/// Scores already extracted vectors. No probing.
pub fn predict_vectors<C: Classifier>(
    model: &TrainedModel<C>,
    vectors: &[FeatureVector],
) -> Result<Vec<Prediction>> {
    let proba = model.predict_proba(vectors)?;
    proba
        .outer_iter()
        .map(|row| {
            let (best, confidence) = argmax(row.iter().copied());
            let label = FirewallLabel::from_index(best)
                .ok_or_else(|| FwError::Classifier(format!("class index {} out of range", best)))?;
            Ok(Prediction {
                label,
                confidence,
                probabilities: row.to_vec(),
            })
        })
        .collect()
}

pub struct FirewallClassifier<A, C> {
    model: TrainedModel<C>,
    extractor: FeatureExtractor<A>,
}

impl<A: ProbeAdapter, C: Classifier> FirewallClassifier<A, C> {
    /// Refuses a model whose stored feature order differs from the
    /// extractor's.
    pub fn new(model: TrainedModel<C>, extractor: FeatureExtractor<A>) -> Result<Self> {
        model.check_schema(&extractor.feature_names())?;
        Ok(Self { model, extractor })
    }

    pub fn model(&self) -> &TrainedModel<C> {
        &self.model
    }

    pub fn classify_vector(&self, vector: &FeatureVector) -> Result<Prediction> {
        predict_vectors(&self.model, std::slice::from_ref(vector))?
            .pop()
            .ok_or_else(|| FwError::Classifier("no prediction returned".into()))
    }

    pub async fn classify(&self, target: IpAddr) -> Result<Classification> {
        let extraction = self.extractor.collect_features(target).await;
        if extraction.all_failed() {
            warn!("{}: every probe failed, classifying sentinel features", target);
        }
        let prediction = self.classify_vector(&extraction.vector)?;
        info!(
            "{} -> {} ({:.1}%)",
            target,
            prediction.label,
            prediction.confidence * 100.0
        );
        Ok(Classification {
            target,
            label: prediction.label,
            confidence: prediction.confidence,
            probabilities: prediction.probabilities,
            features: extraction.vector,
            failed_probes: extraction.failures,
        })
    }

    /// Classifies each target on its own, in order.
    pub async fn classify_batch(&self, targets: &[IpAddr]) -> Result<Vec<Classification>> {
        let mut results = Vec::with_capacity(targets.len());
        for &target in targets {
            results.push(self.classify(target).await?);
        }
        Ok(results)
    }
}
