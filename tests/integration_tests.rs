use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array2;
use tempfile::TempDir;

use fwscope::classify::FirewallClassifier;
use fwscope::config::{FingerprintConfig, LabelMap, TrainingSettings};
use fwscope::dataset::{Dataset, DatasetBuilder, LabeledSample};
use fwscope::features::{feature_names, FeatureExtractor, FeatureVector, FEATURE_COUNT};
use fwscope::model::split::stratified_split;
use fwscope::model::{train, Classifier, Estimator, ForestParams, TrainedModel};
use fwscope::probe::transcript::{self, Transcript};
use fwscope::probe::{FailureReason, ProbeAdapter, ProbeFailure, ProbeKind, ProbeOutcome, RawOutput};
use fwscope::validate::{predictions_path, validate, MixedLabelPolicy, ValidationOutcome};
use fwscope::{FirewallLabel, FwError};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Open,
    Stateless,
    Stateful,
    Proxy,
    Dead,
}

/// Replays canned tool output per target.
struct ScriptedAdapter {
    hosts: HashMap<IpAddr, Behavior>,
}

impl ScriptedAdapter {
    fn new(hosts: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            hosts: hosts.iter().map(|(ip, b)| (ip.parse().unwrap(), *b)).collect(),
        })
    }
}

fn last_octet(target: IpAddr) -> f64 {
    match target {
        IpAddr::V4(v4) => v4.octets()[3] as f64,
        IpAddr::V6(_) => 0.0,
    }
}

fn ping_replies(target: IpAddr) -> String {
    let t = 0.3 + last_octet(target) * 0.01;
    let mut text = format!("PING {0} ({0}) 56(84) bytes of data.\n", target);
    for seq in 1..=5 {
        text.push_str(&format!("64 bytes from {}: icmp_seq={} ttl=64 time={:.3} ms\n", target, seq, t));
    }
    text.push_str(&format!(
        "\n--- {} ping statistics ---\n5 packets transmitted, 5 received, 0% packet loss, time 4005ms\nrtt min/avg/max/mdev = {:.3}/{:.3}/{:.3}/0.000 ms\n",
        target, t, t, t
    ));
    text
}

fn ping_silent(target: IpAddr) -> String {
    format!(
        "PING {0} ({0}) 56(84) bytes of data.\n\n--- {0} ping statistics ---\n5 packets transmitted, 0 received, 100% packet loss, time 4093ms\n",
        target
    )
}

fn nmap(target: IpAddr, not_shown: &str, seconds: f64) -> String {
    format!(
        "Starting Nmap 7.94 ( https://nmap.org )\nNmap scan report for {}\nHost is up (0.00040s latency).\nNot shown: {}\nPORT   STATE SERVICE\n22/tcp open  ssh\n80/tcp open  http\n\nNmap done: 1 IP address (1 host up) scanned in {:.2} seconds\n",
        target, not_shown, seconds
    )
}

fn hping(target: IpAddr, port: u16, flags: Option<&str>) -> String {
    let mut text = format!("HPING {0} (eth0 {0}): S set, 40 headers + 0 data bytes\n", target);
    let received = if let Some(flags) = flags {
        for seq in 0..5 {
            text.push_str(&format!(
                "len=46 ip={} ttl=64 DF id=0 sport={} flags={} seq={} win=64240 rtt=0.4 ms\n",
                target, port, flags, seq
            ));
        }
        5
    } else {
        0
    };
    text.push_str(&format!(
        "\n--- {} hping statistic ---\n5 packets tramitted, {} packets received, {}% packet loss\n",
        target,
        received,
        100 - received * 20
    ));
    text
}

fn http(extra_headers: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nDate: Mon, 01 Jan 2024 00:00:00 GMT\r\nServer: nginx/1.24.0\r\nContent-Type: text/html\r\n{}\r\n\n0.004200\n",
        extra_headers
    )
}

fn ok(text: String) -> ProbeOutcome {
    Ok(RawOutput::new(text, Duration::from_millis(250)))
}

fn timeout(kind: ProbeKind) -> ProbeOutcome {
    Err(ProbeFailure::new(kind, FailureReason::Timeout(Duration::from_secs(8))))
}

#[async_trait]
impl ProbeAdapter for ScriptedAdapter {
    async fn run_probe(&self, kind: ProbeKind, target: IpAddr, _timeout: Duration) -> ProbeOutcome {
        let behavior = self.hosts.get(&target).copied().unwrap_or(Behavior::Dead);
        if behavior == Behavior::Dead {
            return Err(ProbeFailure::new(kind, FailureReason::Unreachable("exit status 1".into())));
        }

        match kind {
            ProbeKind::Reachability => match behavior {
                Behavior::Stateful => ok(Transcript::new().with(transcript::PING, ping_silent(target)).render()),
                _ => ok(Transcript::new().with(transcript::PING, ping_replies(target)).render()),
            },
            ProbeKind::PortScan => match behavior {
                Behavior::Stateless => ok(nmap(
                    target,
                    "1010 closed tcp ports (reset), 12 filtered tcp ports (no-response)",
                    4.1,
                )),
                Behavior::Stateful => ok(nmap(target, "1022 filtered tcp ports (no-response)", 21.3)),
                _ => ok(nmap(target, "1022 closed tcp ports (reset)", 0.52)),
            },
            ProbeKind::TcpProbe => {
                let (app, control) = match behavior {
                    Behavior::Stateless => (Some("SA"), None),
                    Behavior::Stateful => (None, None),
                    _ => (Some("SA"), Some("RA")),
                };
                ok(Transcript::new()
                    .with(transcript::SYN_APP, hping(target, 80, app))
                    .with(transcript::SYN_CONTROL, hping(target, 22, control))
                    .render())
            }
            ProbeKind::HttpProbe => match behavior {
                Behavior::Stateful => timeout(kind),
                Behavior::Proxy => ok(Transcript::new()
                    .with(
                        transcript::HTTP_HEADERS,
                        http("Via: 1.1 gateway (squid/5.7)\r\nX-Cache: MISS from gateway\r\n"),
                    )
                    .render()),
                _ => ok(Transcript::new().with(transcript::HTTP_HEADERS, http("")).render()),
            },
        }
    }
}

fn config() -> Arc<FingerprintConfig> {
    let mut config = FingerprintConfig::default();
    config.collection.iteration_delay_ms = 0;
    Arc::new(config)
}

fn quick_training() -> TrainingSettings {
    TrainingSettings {
        forest: ForestParams {
            n_trees: 25,
            max_features: Some(FEATURE_COUNT),
            ..ForestParams::default()
        },
        ..TrainingSettings::default()
    }
}

fn label_map(entries: &[(&str, FirewallLabel)]) -> LabelMap {
    entries.iter().map(|(ip, l)| (ip.parse().unwrap(), *l)).collect()
}

fn lab() -> Vec<(&'static str, Behavior, FirewallLabel)> {
    let mut hosts = Vec::new();
    let groups = [
        (["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"], Behavior::Open, FirewallLabel::NoFirewall),
        (["10.0.1.1", "10.0.1.2", "10.0.1.3", "10.0.1.4"], Behavior::Stateless, FirewallLabel::Stateless),
        (["10.0.2.1", "10.0.2.2", "10.0.2.3", "10.0.2.4"], Behavior::Stateful, FirewallLabel::Stateful),
        (["10.0.3.1", "10.0.3.2", "10.0.3.3", "10.0.3.4"], Behavior::Proxy, FirewallLabel::Proxy),
    ];
    for (ips, behavior, label) in groups {
        for ip in ips {
            hosts.push((ip, behavior, label));
        }
    }
    hosts
}

/// Collects the four-class lab twice over and trains on it.
async fn trained_lab_model() -> (TrainedModel, Dataset) {
    let hosts = lab();
    let scripted: Vec<(&str, Behavior)> = hosts.iter().map(|(ip, b, _)| (*ip, *b)).collect();
    let labels = label_map(&hosts.iter().map(|(ip, _, l)| (*ip, *l)).collect::<Vec<_>>());
    let targets: Vec<IpAddr> = hosts.iter().map(|(ip, _, _)| ip.parse().unwrap()).collect();

    let builder = DatasetBuilder::new(FeatureExtractor::new(ScriptedAdapter::new(&scripted), config()));
    let summary = builder.build(&targets, &labels, 2).await.unwrap();
    assert!(summary.flagged.is_empty());
    let (model, _) = train(&summary.dataset, &quick_training()).unwrap();
    (model, summary.dataset)
}

#[tokio::test]
async fn test_scripted_profiles_produce_expected_features() {
    let adapter = ScriptedAdapter::new(&[
        ("10.0.0.1", Behavior::Open),
        ("10.0.1.1", Behavior::Stateless),
        ("10.0.2.1", Behavior::Stateful),
        ("10.0.3.1", Behavior::Proxy),
    ]);
    let extractor = FeatureExtractor::new(adapter, config());

    let open = extractor.collect_features("10.0.0.1".parse().unwrap()).await.vector;
    assert!(open.icmp_reachable);
    assert_eq!(open.ttl_return, 64);
    assert_eq!(open.filtered_ports_count, 0);
    assert_eq!(open.syn_ack_ratio, 1.0);
    assert_eq!(open.tcp_reset_ratio, 1.0);
    assert!((open.response_time - 4.2).abs() < 1e-9);
    assert!(!open.header_modified);

    let stateless = extractor.collect_features("10.0.1.1".parse().unwrap()).await.vector;
    assert_eq!(stateless.filtered_ports_count, 12);
    assert_eq!(stateless.tcp_reset_ratio, 0.0);

    let stateful = extractor.collect_features("10.0.2.1".parse().unwrap()).await;
    assert!(!stateful.vector.icmp_reachable);
    assert_eq!(stateful.vector.packet_loss, 1.0);
    assert_eq!(stateful.vector.filtered_ports_count, 1022);
    assert_eq!(stateful.vector.response_time, 9999.0);
    assert_eq!(stateful.failures.len(), 1);

    let proxy = extractor.collect_features("10.0.3.1".parse().unwrap()).await.vector;
    assert!(proxy.header_modified);
}

#[tokio::test]
async fn test_unfiltered_lab_trains_and_classifies_new_host() {
    let dir = TempDir::new().unwrap();
    let data_path = dir.path().join("data").join("firewall_dataset.csv");
    let model_path = dir.path().join("models").join("firewall_classifier.json");

    let adapter = ScriptedAdapter::new(&[
        ("10.0.0.1", Behavior::Open),
        ("10.0.0.2", Behavior::Open),
        ("10.0.0.3", Behavior::Open),
        ("10.0.0.4", Behavior::Open),
        ("10.0.0.5", Behavior::Open),
    ]);
    let labels = label_map(&[
        ("10.0.0.1", FirewallLabel::NoFirewall),
        ("10.0.0.2", FirewallLabel::NoFirewall),
        ("10.0.0.3", FirewallLabel::NoFirewall),
        ("10.0.0.4", FirewallLabel::NoFirewall),
    ]);
    let targets: Vec<IpAddr> = labels.keys().copied().collect();

    let builder = DatasetBuilder::new(FeatureExtractor::new(adapter.clone(), config()));
    let summary = builder.build(&targets, &labels, 1).await.unwrap();
    summary.dataset.append_to(&data_path).unwrap();

    let dataset = Dataset::load(&data_path).unwrap();
    assert_eq!(dataset.len(), 4);
    let (model, report) = train(&dataset, &quick_training()).unwrap();
    assert_eq!(report.test_samples, 1);
    model.save(&model_path).unwrap();

    let model: TrainedModel = TrainedModel::load(&model_path).unwrap();
    let classifier = FirewallClassifier::new(model, FeatureExtractor::new(adapter, config())).unwrap();
    let result = classifier.classify("10.0.0.5".parse().unwrap()).await.unwrap();
    assert_eq!(result.label, FirewallLabel::NoFirewall);
    assert!(result.confidence >= 0.5);
    assert!(result.features.icmp_reachable);
    assert_eq!(result.features.filtered_ports_count, 0);
    assert!(!result.features.header_modified);
}

#[tokio::test]
async fn test_dead_host_still_gets_a_label() {
    let (model, _) = trained_lab_model().await;
    let classifier =
        FirewallClassifier::new(model, FeatureExtractor::new(ScriptedAdapter::new(&[]), config())).unwrap();

    let result = classifier.classify("203.0.113.7".parse().unwrap()).await.unwrap();
    assert_eq!(
        result.features,
        FeatureVector::all_sentinel(&FingerprintConfig::default().sentinels)
    );
    assert_eq!(result.failed_probes.len(), 4);
    assert!((0.0..=1.0).contains(&result.confidence));
    assert!((result.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    assert!(FirewallLabel::ALL.contains(&result.label));
}

#[tokio::test]
async fn test_batch_classifies_each_target() {
    let (model, _) = trained_lab_model().await;
    let adapter = ScriptedAdapter::new(&[
        ("192.0.2.10", Behavior::Open),
        ("192.0.2.11", Behavior::Stateless),
        ("192.0.2.12", Behavior::Stateful),
        ("192.0.2.13", Behavior::Proxy),
    ]);
    let classifier = FirewallClassifier::new(model, FeatureExtractor::new(adapter, config())).unwrap();
    let targets: Vec<IpAddr> = ["192.0.2.10", "192.0.2.11", "192.0.2.12", "192.0.2.13"]
        .iter()
        .map(|ip| ip.parse().unwrap())
        .collect();

    let results = classifier.classify_batch(&targets).await.unwrap();
    let labels: Vec<FirewallLabel> = results.iter().map(|r| r.label).collect();
    assert_eq!(labels, FirewallLabel::ALL.to_vec());
    assert_eq!(results[3].target, targets[3]);
}

#[tokio::test]
async fn test_validation_on_agreeing_labels_is_perfect() {
    let (model, dataset) = trained_lab_model().await;

    // Relabel every row with the model's own prediction.
    let vectors: Vec<FeatureVector> = dataset.iter().map(|s| s.features).collect();
    let predicted = model.predict(&vectors).unwrap();
    let agreeing = Dataset::from_samples(
        dataset
            .iter()
            .zip(predicted)
            .map(|(s, label)| LabeledSample {
                label: Some(label),
                ..s.clone()
            })
            .collect(),
    );

    match validate(&agreeing, &model, MixedLabelPolicy::default()).unwrap() {
        ValidationOutcome::Evaluated(report) => {
            assert_eq!(report.metrics.accuracy, 1.0);
            assert!(report.misclassified.is_empty());
            assert_eq!(report.metrics.samples, dataset.len());
        }
        other => panic!("expected evaluation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_validation_lists_misclassified_rows() {
    let (model, dataset) = trained_lab_model().await;
    let mut samples = dataset.into_samples();
    samples[0].label = Some(FirewallLabel::Proxy);
    let tampered = Dataset::from_samples(samples);

    match validate(&tampered, &model, MixedLabelPolicy::default()).unwrap() {
        ValidationOutcome::Evaluated(report) => {
            assert_eq!(report.misclassified.len(), 1);
            let miss = &report.misclassified[0];
            assert_eq!(miss.row, 1);
            assert_eq!(miss.actual, FirewallLabel::Proxy);
            assert_eq!(miss.predicted, FirewallLabel::NoFirewall);
            assert!(report.metrics.accuracy < 1.0);
        }
        other => panic!("expected evaluation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unlabeled_validation_writes_predictions() {
    let dir = TempDir::new().unwrap();
    let (model, dataset) = trained_lab_model().await;
    let unlabeled = Dataset::from_samples(
        dataset
            .iter()
            .map(|s| LabeledSample {
                label: None,
                ..s.clone()
            })
            .collect(),
    );
    let input = dir.path().join("unseen.csv");
    unlabeled.save(&input).unwrap();
    let loaded = Dataset::load(&input).unwrap();

    let predicted = match validate(&loaded, &model, MixedLabelPolicy::default()).unwrap() {
        ValidationOutcome::Predicted(predicted) => predicted,
        other => panic!("expected predictions, got {:?}", other),
    };
    let output = predictions_path(&input);
    assert_eq!(output, dir.path().join("unseen_predictions.csv"));
    predicted.save_predictions(&output).unwrap();

    let text = std::fs::read_to_string(&output).unwrap();
    assert!(text.lines().next().unwrap().ends_with(",firewall_label,label_name"));

    let written = Dataset::load(&output).unwrap();
    assert_eq!(written.len(), loaded.len());
    assert!(written.is_fully_labeled());
    for ((before, after), line) in loaded.iter().zip(written.iter()).zip(text.lines().skip(1)) {
        assert_eq!(before.features, after.features);
        assert_eq!(before.target, after.target);
        assert!(line.ends_with(after.label.unwrap().name()));
    }
}

#[tokio::test]
async fn test_mixed_label_policies() {
    let (model, dataset) = trained_lab_model().await;
    let mut samples = dataset.into_samples();
    samples[5].label = None;
    let mixed = Dataset::from_samples(samples);

    assert!(matches!(
        validate(&mixed, &model, MixedLabelPolicy::TreatAsUnlabeled).unwrap(),
        ValidationOutcome::Predicted(ref d) if d.len() == mixed.len()
    ));
    match validate(&mixed, &model, MixedLabelPolicy::EvaluateLabeled).unwrap() {
        ValidationOutcome::Evaluated(report) => {
            assert_eq!(report.skipped_unlabeled, 1);
            assert_eq!(report.metrics.samples, mixed.len() - 1);
        }
        other => panic!("expected evaluation, got {:?}", other),
    }
    assert!(matches!(
        validate(&mixed, &model, MixedLabelPolicy::Reject),
        Err(FwError::DatasetIntegrity { row: 6, .. })
    ));
}

#[tokio::test]
async fn test_schema_mismatch_is_refused() {
    let (mut model, dataset) = trained_lab_model().await;
    model.feature_names.reverse();

    let result = FirewallClassifier::new(model, FeatureExtractor::new(ScriptedAdapter::new(&[]), config()));
    let err = result.err().expect("mismatched model must be refused");
    assert!(matches!(err, FwError::SchemaMismatch { .. }));
    assert_eq!(err.exit_code(), 4);

    let (mut model, _) = trained_lab_model().await;
    model.feature_names.truncate(FEATURE_COUNT - 1);
    assert!(matches!(
        validate(&dataset, &model, MixedLabelPolicy::default()),
        Err(FwError::SchemaMismatch { .. })
    ));
}

#[test]
fn test_feature_order_changes_predictions() {
    let open = FeatureVector {
        avg_latency: 0.4,
        packet_loss: 0.0,
        ttl_return: 64,
        icmp_reachable: true,
        filtered_ports_count: 0,
        scan_time: 0.5,
        syn_ack_ratio: 1.0,
        tcp_reset_ratio: 1.0,
        response_time: 4.0,
        header_modified: false,
    };
    let proxied = FeatureVector {
        header_modified: true,
        ..open
    };

    let rows: Vec<f64> = (0..20)
        .flat_map(|i| if i % 2 == 0 { open.to_array() } else { proxied.to_array() })
        .collect();
    let y: Vec<FirewallLabel> = (0..20)
        .map(|i| if i % 2 == 0 { FirewallLabel::NoFirewall } else { FirewallLabel::Proxy })
        .collect();
    let x = Array2::from_shape_vec((20, FEATURE_COUNT), rows).unwrap();
    let params = ForestParams {
        n_trees: 15,
        max_features: Some(FEATURE_COUNT),
        bootstrap: false,
        ..ForestParams::default()
    };
    let model = params.fit(&x, &y, 11).unwrap();

    let canonical = open.to_array();
    let mut swapped = canonical;
    // icmp_reachable and header_modified trade places.
    swapped.swap(3, 9);
    let query = Array2::from_shape_vec((2, FEATURE_COUNT), [canonical, swapped].concat()).unwrap();
    let predicted = model.predict(&query).unwrap();
    assert_eq!(predicted[0], FirewallLabel::NoFirewall);
    assert_eq!(predicted[1], FirewallLabel::Proxy);
}

#[test]
fn test_dataset_round_trip_sizes() {
    let dir = TempDir::new().unwrap();
    let sentinel = FeatureVector::all_sentinel(&FingerprintConfig::default().sentinels);
    let live = FeatureVector {
        avg_latency: 12.345678,
        packet_loss: 0.2,
        ttl_return: 128,
        icmp_reachable: true,
        filtered_ports_count: 1022,
        scan_time: 21.06,
        syn_ack_ratio: 0.6,
        tcp_reset_ratio: 0.0,
        response_time: 104.25,
        header_modified: true,
    };

    for n in [0usize, 1, 9] {
        let samples: Vec<LabeledSample> = (0..n)
            .map(|i| {
                let features = if i % 3 == 0 { sentinel } else { live };
                let label = FirewallLabel::from_index(i % 5);
                LabeledSample::new(format!("10.1.0.{}", i + 1).parse().unwrap(), features, label)
            })
            .collect();
        let dataset = Dataset::from_samples(samples);
        let path = dir.path().join(format!("rows_{}.csv", n));
        dataset.save(&path).unwrap();
        assert_eq!(Dataset::load(&path).unwrap(), dataset, "{} rows", n);
    }
}

#[test]
fn test_stratified_split_property() {
    for seed in 0..20u64 {
        let counts = [4 + seed as usize % 5, 4, 6 + seed as usize % 3, 9];
        let y: Vec<FirewallLabel> = FirewallLabel::ALL
            .iter()
            .zip(counts)
            .flat_map(|(&l, n)| std::iter::repeat(l).take(n))
            .collect();
        let split = stratified_split(&y, 0.8, seed);
        for label in FirewallLabel::ALL {
            let n = counts[label.index()] as f64;
            let in_train = split.train.iter().filter(|&&i| y[i] == label).count() as f64;
            assert!((in_train - n * 0.8).abs() <= 1.0, "seed {} {:?}", seed, label);
        }
    }
}

#[tokio::test]
async fn test_cross_validation_does_not_outrun_holdout() {
    let hosts = lab();
    let scripted: Vec<(&str, Behavior)> = hosts.iter().map(|(ip, b, _)| (*ip, *b)).collect();
    let labels = label_map(&hosts.iter().map(|(ip, _, l)| (*ip, *l)).collect::<Vec<_>>());
    let targets: Vec<IpAddr> = hosts.iter().map(|(ip, _, _)| ip.parse().unwrap()).collect();
    let builder = DatasetBuilder::new(FeatureExtractor::new(ScriptedAdapter::new(&scripted), config()));
    let dataset = builder.build(&targets, &labels, 3).await.unwrap().dataset;

    let (model, report) = train(&dataset, &quick_training()).unwrap();
    assert_eq!(model.feature_names, feature_names());
    assert_eq!(report.cross_validation.folds, 5);
    assert!(report.cross_validation.mean <= report.test.accuracy + 0.05);
    assert!(report.test.accuracy >= 0.9);
    assert!(report.learning_curve.generalization_gap.abs() <= 0.2);
}

#[tokio::test]
async fn test_strict_collection_rejects_dead_host() {
    let mut config = FingerprintConfig::default();
    config.collection.iteration_delay_ms = 0;
    config.collection.strict = true;
    let builder = DatasetBuilder::new(FeatureExtractor::new(ScriptedAdapter::new(&[]), Arc::new(config)));
    let result = builder
        .build(&["198.51.100.1".parse().unwrap()], &LabelMap::new(), 1)
        .await;
    assert!(matches!(result, Err(FwError::UnsignaledSample { .. })));
}
