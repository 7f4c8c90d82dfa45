pub mod parsers;
pub mod vector;

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::FingerprintConfig;
use crate::probe::{ProbeAdapter, ProbeFailure};
use parsers::{standard_parsers, FeatureParser};
pub use vector::{feature_names, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};

#[derive(Debug, Clone)]
pub struct Extraction {
    pub target: IpAddr,
    pub vector: FeatureVector,
    pub failures: Vec<ProbeFailure>,
}

impl Extraction {
    /// True when no probe produced output, so the vector is pure sentinel.
    pub fn all_failed(&self) -> bool {
        self.failures.len() == crate::probe::ProbeKind::ALL.len()
    }
}

pub struct FeatureExtractor<A> {
    adapter: A,
    config: Arc<FingerprintConfig>,
    parsers: Vec<Box<dyn FeatureParser>>,
}

impl<A: ProbeAdapter> FeatureExtractor<A> {
    pub fn new(adapter: A, config: Arc<FingerprintConfig>) -> Self {
        let parsers = standard_parsers(&config);
        Self {
            adapter,
            config,
            parsers,
        }
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    pub fn feature_names(&self) -> Vec<String> {
        feature_names()
    }

    // Sequential: overlapping traffic skews the timing features.
    pub async fn collect_features(&self, target: IpAddr) -> Extraction {
        info!("collecting features from {}", target);
        let mut vector = FeatureVector::all_sentinel(&self.config.sentinels);
        let mut failures = Vec::new();

        for parser in &self.parsers {
            let kind = parser.kind();
            let timeout = self.config.probes.timeout_for(kind);
            let outcome = self.adapter.run_probe(kind, target, timeout).await;
            if let Err(failure) = &outcome {
                debug!("{}: {}", target, failure);
                failures.push(failure.clone());
            }
            parser.parse(&outcome).apply_to(&mut vector);
        }

        debug!("{} -> {:?}", target, vector);
        Extraction {
            target,
            vector,
            failures,
        }
    }
}
