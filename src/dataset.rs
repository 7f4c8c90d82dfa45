//! Labeled samples, their CSV persistence, and the collection loop that
//! produces them.

use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CollectionSettings, LabelMap};
use crate::error::{FwError, Result};
use crate::features::{FeatureExtractor, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::label::FirewallLabel;
use crate::probe::{ProbeAdapter, ProbeFailure};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const HOST_COLUMN: &str = "host";
pub const LABEL_COLUMN: &str = "firewall_label";
pub const LABEL_NAME_COLUMN: &str = "label_name";

/// Column order of a dataset file.
pub fn dataset_columns() -> Vec<&'static str> {
    let mut columns = vec![TIMESTAMP_COLUMN, HOST_COLUMN];
    columns.extend(FEATURE_NAMES);
    columns.push(LABEL_COLUMN);
    columns
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub target: IpAddr,
    pub features: FeatureVector,
    pub label: Option<FirewallLabel>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LabeledSample {
    pub fn new(target: IpAddr, features: FeatureVector, label: Option<FirewallLabel>) -> Self {
        Self {
            target,
            features,
            label,
            timestamp: Some(Utc::now()),
        }
    }
}

/// On-disk row. Field names are the column names.
#[derive(Debug, Serialize)]
struct CsvRowOut {
    timestamp: Option<DateTime<Utc>>,
    host: IpAddr,
    avg_latency: f64,
    packet_loss: f64,
    ttl_return: u8,
    icmp_reachable: u8,
    filtered_ports_count: u32,
    scan_time: f64,
    syn_ack_ratio: f64,
    tcp_reset_ratio: f64,
    response_time: f64,
    header_modified: u8,
    firewall_label: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label_name: Option<&'static str>,
}

impl From<&LabeledSample> for CsvRowOut {
    fn from(sample: &LabeledSample) -> Self {
        let f = &sample.features;
        Self {
            timestamp: sample.timestamp,
            host: sample.target,
            avg_latency: f.avg_latency,
            packet_loss: f.packet_loss,
            ttl_return: f.ttl_return,
            icmp_reachable: f.icmp_reachable as u8,
            filtered_ports_count: f.filtered_ports_count,
            scan_time: f.scan_time,
            syn_ack_ratio: f.syn_ack_ratio,
            tcp_reset_ratio: f.tcp_reset_ratio,
            response_time: f.response_time,
            header_modified: f.header_modified as u8,
            firewall_label: sample.label.map(u8::from),
            label_name: None,
        }
    }
}

/// Read side is looser: numbers as floats so `64` and `64.0` both load,
/// and the domain checks happen in `FeatureVector::from_array`.
#[derive(Debug, Deserialize)]
struct CsvRowIn {
    #[serde(default)]
    timestamp: Option<String>,
    host: String,
    avg_latency: f64,
    packet_loss: f64,
    ttl_return: f64,
    icmp_reachable: f64,
    filtered_ports_count: f64,
    scan_time: f64,
    syn_ack_ratio: f64,
    tcp_reset_ratio: f64,
    response_time: f64,
    header_modified: f64,
    #[serde(default)]
    firewall_label: Option<String>,
}

impl CsvRowIn {
    fn into_sample(self, row: usize) -> Result<LabeledSample> {
        let integrity = |reason: String| FwError::DatasetIntegrity { row, reason };

        let target: IpAddr = self
            .host
            .trim()
            .parse()
            .map_err(|_| integrity(format!("invalid host '{}'", self.host)))?;

        let values: [f64; FEATURE_COUNT] = [
            self.avg_latency,
            self.packet_loss,
            self.ttl_return,
            self.icmp_reachable,
            self.filtered_ports_count,
            self.scan_time,
            self.syn_ack_ratio,
            self.tcp_reset_ratio,
            self.response_time,
            self.header_modified,
        ];
        let features = FeatureVector::from_array(&values).map_err(integrity)?;

        let label = match self.firewall_label.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let value: f64 = raw
                    .parse()
                    .map_err(|_| integrity(format!("unparsable label '{}'", raw)))?;
                if value.fract() != 0.0 || !(0.0..=255.0).contains(&value) {
                    return Err(integrity(format!("unparsable label '{}'", raw)));
                }
                Some(FirewallLabel::try_from(value as u8).map_err(integrity)?)
            }
        };

        let timestamp = match self.timestamp.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<DateTime<Utc>>()
                    .map_err(|_| integrity(format!("invalid timestamp '{}'", raw)))?,
            ),
        };

        Ok(LabeledSample {
            target,
            features,
            label,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    samples: Vec<LabeledSample>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(samples: Vec<LabeledSample>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: LabeledSample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabeledSample> {
        self.samples.iter()
    }

    pub fn into_samples(self) -> Vec<LabeledSample> {
        self.samples
    }

    pub fn labeled_count(&self) -> usize {
        self.samples.iter().filter(|s| s.label.is_some()).count()
    }

    /// Every row carries a label. An empty dataset is not labeled.
    pub fn is_fully_labeled(&self) -> bool {
        !self.is_empty() && self.labeled_count() == self.len()
    }

    /// Rows that carry a label, in order.
    pub fn labeled(&self) -> Dataset {
        Dataset::from_samples(
            self.samples
                .iter()
                .filter(|s| s.label.is_some())
                .cloned()
                .collect(),
        )
    }

    pub fn label_counts(&self) -> [usize; FirewallLabel::COUNT] {
        let mut counts = [0; FirewallLabel::COUNT];
        for label in self.samples.iter().filter_map(|s| s.label) {
            counts[label.index()] += 1;
        }
        counts
    }

    /// Rows as a matrix in canonical feature order.
    pub fn feature_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.len(), FEATURE_COUNT));
        for (i, sample) in self.samples.iter().enumerate() {
            for (j, value) in sample.features.to_array().into_iter().enumerate() {
                matrix[[i, j]] = value;
            }
        }
        matrix
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        self.write_rows(file, true, false)
    }

    /// Like [`save`](Self::save) with a trailing `label_name` column.
    /// [`load`](Self::load) ignores the extra column.
    pub fn save_predictions(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        self.write_rows(file, true, true)
    }

    /// Appends rows to `path`, writing the header first if the file is new.
    /// An existing file must carry the same columns.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        let existing = path.exists() && fs::metadata(path)?.len() > 0;
        if !existing {
            return self.save(path);
        }

        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let expected = dataset_columns();
        if headers.iter().ne(expected.iter().copied()) {
            return Err(FwError::DatasetIntegrity {
                row: 0,
                reason: format!(
                    "cannot append to {}: columns differ from {}",
                    path.display(),
                    expected.join(",")
                ),
            });
        }

        let file = OpenOptions::new().append(true).open(path)?;
        self.write_rows(file, false, false)
    }

    fn write_rows<W: std::io::Write>(&self, sink: W, header: bool, label_names: bool) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(sink);
        if header {
            let mut columns = dataset_columns();
            if label_names {
                columns.push(LABEL_NAME_COLUMN);
            }
            writer.write_record(columns)?;
        }
        for sample in &self.samples {
            let mut row = CsvRowOut::from(sample);
            if label_names {
                // Unlabeled rows still need the cell.
                row.label_name = Some(sample.label.map(FirewallLabel::name).unwrap_or(""));
            }
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads a dataset file. Rows are numbered from 1 in errors; row 0 is the
    /// header.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FwError::DatasetNotFound(path.to_path_buf()));
        }
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let headers = reader.headers()?.clone();
        let missing: Vec<&str> = std::iter::once(HOST_COLUMN)
            .chain(FEATURE_NAMES)
            .filter(|column| !headers.iter().any(|h| h == *column))
            .collect();
        if !missing.is_empty() {
            return Err(FwError::DatasetIntegrity {
                row: 0,
                reason: format!("missing required column(s): {}", missing.join(", ")),
            });
        }

        let mut samples = Vec::new();
        for (index, record) in reader.deserialize::<CsvRowIn>().enumerate() {
            let row = index + 1;
            let record = record.map_err(|e| FwError::DatasetIntegrity {
                row,
                reason: e.to_string(),
            })?;
            samples.push(record.into_sample(row)?);
        }
        debug!("loaded {} rows from {}", samples.len(), path.display());
        Ok(Self { samples })
    }
}

/// A sample whose every probe failed, kept with sentinel features.
#[derive(Debug, Clone)]
pub struct FlaggedSample {
    pub target: IpAddr,
    pub iteration: u32,
    pub failures: Vec<ProbeFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub dataset: Dataset,
    pub flagged: Vec<FlaggedSample>,
    /// First tool or privilege failure seen per probe kind.
    pub environment: Vec<ProbeFailure>,
    /// The run stopped early on request; `dataset` holds what was gathered.
    pub cancelled: bool,
}

pub struct DatasetBuilder<A> {
    extractor: FeatureExtractor<A>,
    settings: CollectionSettings,
    cancel: Arc<AtomicBool>,
    progress: bool,
}

impl<A: ProbeAdapter> DatasetBuilder<A> {
    pub fn new(extractor: FeatureExtractor<A>) -> Self {
        let settings = extractor.config().collection.clone();
        Self {
            extractor,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: false,
        }
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Flag checked between samples; setting it ends the run after the
    /// in-flight sample.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn build(
        &self,
        targets: &[IpAddr],
        labels: &LabelMap,
        repeat: u32,
    ) -> Result<BuildSummary> {
        let repeat = repeat.max(1);
        let total = targets.len() as u64 * repeat as u64;
        let pb = if self.progress {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} samples ({eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut summary = BuildSummary::default();
        let delay = Duration::from_millis(self.settings.iteration_delay_ms);

        'run: for iteration in 1..=repeat {
            info!("iteration {}/{}", iteration, repeat);
            for &target in targets {
                if self.cancel.load(Ordering::SeqCst) {
                    summary.cancelled = true;
                    break 'run;
                }
                pb.set_message(target.to_string());

                let mut extraction = self.extractor.collect_features(target).await;
                let mut attempt = 0;
                while extraction.all_failed() && attempt < self.settings.max_sample_retries {
                    attempt += 1;
                    debug!("{}: every probe failed, retry {}", target, attempt);
                    extraction = self.extractor.collect_features(target).await;
                }

                for failure in extraction.failures.iter().filter(|f| f.is_environmental()) {
                    if summary.environment.iter().all(|seen| seen.kind != failure.kind) {
                        warn!("{}; its features fall back to sentinels for this run", failure);
                        summary.environment.push(failure.clone());
                    }
                }

                if extraction.all_failed() {
                    warn!(
                        "{} (iteration {}): all probes failed, keeping sentinel row",
                        target, iteration
                    );
                    summary.flagged.push(FlaggedSample {
                        target,
                        iteration,
                        failures: extraction.failures.clone(),
                    });
                    if self.settings.strict {
                        pb.finish_and_clear();
                        return Err(FwError::UnsignaledSample {
                            target: target.to_string(),
                            count: summary.flagged.len(),
                        });
                    }
                } else if !extraction.failures.is_empty() {
                    let kinds: Vec<String> =
                        extraction.failures.iter().map(|f| f.kind.to_string()).collect();
                    info!("{}: partial sample, failed probes: {}", target, kinds.join(", "));
                }

                let label = labels.get(&target).copied();
                if let Some(label) = label {
                    debug!("{} labeled {} ({})", target, u8::from(label), label);
                }
                summary
                    .dataset
                    .push(LabeledSample::new(target, extraction.vector, label));
                pb.inc(1);
            }

            if iteration < repeat && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        pb.finish_and_clear();
        Ok(summary)
    }
}
