//! Immutable run configuration.
//!
//! Everything that used to be ambient state (label assignments, sentinel
//! values, probe timeouts, evaluation policy) lives here and is handed to the
//! extractor, builder, trainer and validator at construction time.

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FwError, Result};
use crate::label::FirewallLabel;
use crate::model::forest::ForestParams;
use crate::probe::ProbeKind;
use crate::validate::MixedLabelPolicy;

pub type LabelMap = BTreeMap<IpAddr, FirewallLabel>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub probes: ProbeSettings,
    pub sentinels: Sentinels,
    pub http: HttpInspection,
    pub labels: LabelMap,
    pub collection: CollectionSettings,
    pub training: TrainingSettings,
    pub validation: ValidationSettings,
    pub artifacts: ArtifactPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub reachability_timeout_secs: u64,
    pub port_scan_timeout_secs: u64,
    pub tcp_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub ping_count: u32,
    pub large_ping_size: u32,
    pub syn_count: u32,
    /// Port whose SYN/ACK rate feeds `syn_ack_ratio`.
    pub app_port: u16,
    /// Port whose RST rate feeds `tcp_reset_ratio`.
    pub control_port: u16,
    pub scan_start: u16,
    pub scan_end: u16,
    pub proxy_ports: Vec<u16>,
    pub proxy_probe_url: String,
    pub marker_header: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            reachability_timeout_secs: 10,
            port_scan_timeout_secs: 120,
            tcp_timeout_secs: 10,
            http_timeout_secs: 8,
            ping_count: 5,
            large_ping_size: 1400,
            syn_count: 5,
            app_port: 80,
            control_port: 22,
            scan_start: 1,
            scan_end: 1024,
            proxy_ports: vec![3128, 8080, 8888],
            proxy_probe_url: "http://example.com".to_string(),
            marker_header: "X-Fwscope-Test: 1".to_string(),
        }
    }
}

impl ProbeSettings {
    pub fn timeout_for(&self, kind: ProbeKind) -> Duration {
        let secs = match kind {
            ProbeKind::Reachability => self.reachability_timeout_secs,
            ProbeKind::PortScan => self.port_scan_timeout_secs,
            ProbeKind::TcpProbe => self.tcp_timeout_secs,
            ProbeKind::HttpProbe => self.http_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn marker_header_name(&self) -> String {
        self.marker_header
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase()
    }
}

/// Values substituted when a probe yields nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sentinels {
    pub unreachable_latency_ms: f64,
    pub no_response_time_ms: f64,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            unreachable_latency_ms: 9999.0,
            no_response_time_ms: 9999.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpInspection {
    /// Response headers an origin server emits on its own.
    pub clean_headers: Vec<String>,
    /// Substrings that betray a proxy or cache in the response.
    pub proxy_indicators: Vec<String>,
}

impl Default for HttpInspection {
    fn default() -> Self {
        let clean = [
            "accept-ranges",
            "allow",
            "cache-control",
            "connection",
            "content-encoding",
            "content-language",
            "content-length",
            "content-location",
            "content-security-policy",
            "content-type",
            "date",
            "etag",
            "expires",
            "keep-alive",
            "last-modified",
            "link",
            "location",
            "pragma",
            "referrer-policy",
            "retry-after",
            "server",
            "set-cookie",
            "strict-transport-security",
            "transfer-encoding",
            "upgrade",
            "vary",
            "www-authenticate",
            "x-content-type-options",
            "x-frame-options",
            "x-powered-by",
            "x-xss-protection",
        ];
        let indicators = [
            "via",
            "x-cache",
            "x-proxy",
            "proxy-agent",
            "x-forwarded",
            "x-squid",
            "cache-status",
            "squid",
        ];
        Self {
            clean_headers: clean.iter().map(|s| s.to_string()).collect(),
            proxy_indicators: indicators.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub repeat: u32,
    /// Extra attempts for a sample whose four probes all failed.
    pub max_sample_retries: u32,
    /// Reject the whole run when any sample carries no signal.
    pub strict: bool,
    pub iteration_delay_ms: u64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            repeat: 1,
            max_sample_retries: 1,
            strict: false,
            iteration_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub split_ratio: f64,
    pub stratify: bool,
    pub cv_folds: usize,
    pub learning_curve_points: usize,
    pub seed: u64,
    pub forest: ForestParams,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            split_ratio: 0.8,
            stratify: true,
            cv_folds: 5,
            learning_curve_points: 10,
            seed: 42,
            forest: ForestParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub mixed_labels: MixedLabelPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub report: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models").join("firewall_classifier.json"),
            report: PathBuf::from("results").join("metrics.json"),
        }
    }
}

impl FingerprintConfig {
    /// Loads `explicit` if given, else the per-user config file if it exists,
    /// else the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(FwError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Self::from_file(path)?
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| FwError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("fwscope");
        path.push("config.json");
        Some(path)
    }

    pub fn validate(&self) -> Result<()> {
        let training = &self.training;
        if !(training.split_ratio > 0.0 && training.split_ratio < 1.0) {
            return Err(FwError::Config(format!(
                "training.split_ratio must be in (0, 1), got {}",
                training.split_ratio
            )));
        }
        if training.cv_folds < 2 {
            return Err(FwError::Config("training.cv_folds must be at least 2".into()));
        }
        if training.learning_curve_points == 0 {
            return Err(FwError::Config("training.learning_curve_points must be positive".into()));
        }
        if training.forest.n_trees == 0 || training.forest.max_depth == 0 {
            return Err(FwError::Config("training.forest needs n_trees > 0 and max_depth > 0".into()));
        }
        let probes = &self.probes;
        if probes.scan_start == 0 || probes.scan_start > probes.scan_end {
            return Err(FwError::Config(format!(
                "invalid scan range {}-{}",
                probes.scan_start, probes.scan_end
            )));
        }
        if probes.ping_count == 0 || probes.syn_count == 0 {
            return Err(FwError::Config("probe counts must be positive".into()));
        }
        Ok(())
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels.extend(labels);
        self
    }
}

/// Parses `"10.0.0.1=0,10.0.0.2=3"` into a label map.
pub fn parse_label_map(spec: &str) -> Result<LabelMap> {
    let mut labels = LabelMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, label) = entry
            .split_once('=')
            .ok_or_else(|| FwError::Config(format!("label mapping '{}' is not host=label", entry)))?;
        let ip: IpAddr = host
            .trim()
            .parse()
            .map_err(|_| FwError::Config(format!("invalid address in label map: {}", host)))?;
        let raw: u8 = label
            .trim()
            .parse()
            .map_err(|_| FwError::Config(format!("invalid label for {}: {}", host, label)))?;
        let label = FirewallLabel::try_from(raw).map_err(FwError::Config)?;
        labels.insert(ip, label);
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = FingerprintConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probes.timeout_for(ProbeKind::PortScan), Duration::from_secs(120));
        assert_eq!(config.probes.marker_header_name(), "x-fwscope-test");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "training": { "split_ratio": 0.7 }, "labels": { "10.0.0.1": 2 } }"#;
        let config: FingerprintConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.training.split_ratio, 0.7);
        assert_eq!(config.training.cv_folds, 5);
        assert_eq!(
            config.labels.get(&"10.0.0.1".parse::<IpAddr>().unwrap()),
            Some(&FirewallLabel::Stateful)
        );
        assert_eq!(config.probes.app_port, 80);
    }

    #[test]
    fn test_invalid_split_ratio_rejected() {
        let mut config = FingerprintConfig::default();
        config.training.split_ratio = 1.0;
        assert!(matches!(config.validate(), Err(FwError::Config(_))));
    }

    #[test]
    fn test_parse_label_map() {
        let labels = parse_label_map("192.168.56.10=0, 192.168.56.11=3").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(
            labels[&"192.168.56.11".parse::<IpAddr>().unwrap()],
            FirewallLabel::Proxy
        );
        assert!(parse_label_map("192.168.56.10=9").is_err());
        assert!(parse_label_map("192.168.56.10").is_err());
        assert!(parse_label_map("").unwrap().is_empty());
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let result = FingerprintConfig::load(Some(Path::new("/nonexistent/fwscope.json")));
        assert!(matches!(result, Err(FwError::Config(_))));
    }
}
