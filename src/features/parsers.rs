//! One parser per probe kind.
//!
//! Every parser is total: a [`ProbeFailure`](crate::probe::ProbeFailure) or
//! text it cannot make sense of yields that kind's fallback values, never an
//! error. Each parser owns a disjoint slice of the [`FeatureVector`].

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use statrs::statistics::Statistics;

use super::vector::FeatureVector;
use crate::config::{FingerprintConfig, HttpInspection, Sentinels};
use crate::probe::transcript::{self, Transcript};
use crate::probe::{ProbeKind, ProbeOutcome};

lazy_static! {
    static ref TTL: Regex = Regex::new(r"(?i)ttl=(\d+)").unwrap();
    static ref LOSS: Regex = Regex::new(r"(?i)(\d+(?:\.\d+)?)%\s+(?:packet\s+)?loss").unwrap();
    static ref TX_RX: Regex =
        Regex::new(r"(?i)(\d+)\s+packets\s+transmitted,\s+(\d+)\s+(?:packets\s+)?received").unwrap();
    static ref RTT_SUMMARY: Regex =
        Regex::new(r"(?i)(?:rtt|round-trip)[^=]*=\s*[\d.]+/([\d.]+)/").unwrap();
    static ref REPLY_TIME: Regex = Regex::new(r"(?i)time[=<]\s*([\d.]+)\s*ms").unwrap();

    static ref FILTERED_PORT: Regex = Regex::new(r"(?im)^(\d+)/tcp\s+filtered").unwrap();
    static ref NOT_SHOWN_FILTERED: Regex =
        Regex::new(r"(?i)not shown:[^\n]*?(\d+)\s+filtered").unwrap();
    static ref ALL_FILTERED: Regex =
        Regex::new(r"(?i)all\s+(\d+)\s+scanned ports on .* are filtered").unwrap();
    static ref SCAN_DURATION: Regex = Regex::new(r"(?i)scanned in ([\d.]+) seconds").unwrap();

    static ref HPING_FLAGS: Regex = Regex::new(r"flags=([A-Z]+)").unwrap();
    static ref HPING_SENT: Regex = Regex::new(r"(?i)(\d+)\s+packets\s+tra(?:ns)?mitted").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReachabilityFeatures {
    pub avg_latency: f64,
    pub packet_loss: f64,
    pub ttl_return: u8,
    pub icmp_reachable: bool,
}

impl ReachabilityFeatures {
    pub fn unreachable(sentinels: &Sentinels) -> Self {
        Self {
            avg_latency: sentinels.unreachable_latency_ms,
            packet_loss: 1.0,
            ttl_return: 0,
            icmp_reachable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortScanFeatures {
    pub filtered_ports_count: u32,
    pub scan_time: f64,
}

impl PortScanFeatures {
    /// Unscannable is recorded as "nothing filtered". This biases failed
    /// scans toward the unfiltered class.
    pub const UNSCANNED: PortScanFeatures = PortScanFeatures {
        filtered_ports_count: 0,
        scan_time: 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcpFeatures {
    pub syn_ack_ratio: f64,
    pub tcp_reset_ratio: f64,
}

impl TcpFeatures {
    pub const SILENT: TcpFeatures = TcpFeatures {
        syn_ack_ratio: 0.0,
        tcp_reset_ratio: 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpFeatures {
    pub response_time: f64,
    pub header_modified: bool,
}

impl HttpFeatures {
    pub fn no_response(sentinels: &Sentinels) -> Self {
        Self {
            response_time: sentinels.no_response_time_ms,
            header_modified: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeFeatures {
    Reachability(ReachabilityFeatures),
    PortScan(PortScanFeatures),
    Tcp(TcpFeatures),
    Http(HttpFeatures),
}

impl ProbeFeatures {
    pub fn apply_to(&self, vector: &mut FeatureVector) {
        match *self {
            ProbeFeatures::Reachability(r) => {
                vector.avg_latency = r.avg_latency;
                vector.packet_loss = r.packet_loss;
                vector.ttl_return = r.ttl_return;
                vector.icmp_reachable = r.icmp_reachable;
            }
            ProbeFeatures::PortScan(p) => {
                vector.filtered_ports_count = p.filtered_ports_count;
                vector.scan_time = p.scan_time;
            }
            ProbeFeatures::Tcp(t) => {
                vector.syn_ack_ratio = t.syn_ack_ratio;
                vector.tcp_reset_ratio = t.tcp_reset_ratio;
            }
            ProbeFeatures::Http(h) => {
                vector.response_time = h.response_time;
                vector.header_modified = h.header_modified;
            }
        }
    }
}

pub trait FeatureParser: Send + Sync {
    fn kind(&self) -> ProbeKind;
    fn parse(&self, outcome: &ProbeOutcome) -> ProbeFeatures;
}

pub struct ReachabilityParser {
    pub sentinels: Sentinels,
}

pub struct PortScanParser {
    pub scan_start: u16,
    pub scan_end: u16,
}

pub struct TcpProbeParser {
    pub syn_count: u32,
}

pub struct HttpProbeParser {
    pub sentinels: Sentinels,
    pub inspection: HttpInspection,
    pub marker_header: String,
}

impl FeatureParser for ReachabilityParser {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Reachability
    }

    fn parse(&self, outcome: &ProbeOutcome) -> ProbeFeatures {
        ProbeFeatures::Reachability(parse_reachability(outcome, &self.sentinels))
    }
}

impl FeatureParser for PortScanParser {
    fn kind(&self) -> ProbeKind {
        ProbeKind::PortScan
    }

    fn parse(&self, outcome: &ProbeOutcome) -> ProbeFeatures {
        ProbeFeatures::PortScan(parse_port_scan(outcome, self.scan_start, self.scan_end))
    }
}

impl FeatureParser for TcpProbeParser {
    fn kind(&self) -> ProbeKind {
        ProbeKind::TcpProbe
    }

    fn parse(&self, outcome: &ProbeOutcome) -> ProbeFeatures {
        ProbeFeatures::Tcp(parse_tcp_probe(outcome, self.syn_count))
    }
}

impl FeatureParser for HttpProbeParser {
    fn kind(&self) -> ProbeKind {
        ProbeKind::HttpProbe
    }

    fn parse(&self, outcome: &ProbeOutcome) -> ProbeFeatures {
        ProbeFeatures::Http(parse_http_probe(
            outcome,
            &self.inspection,
            &self.marker_header,
            &self.sentinels,
        ))
    }
}

/// The four parsers in canonical probe order.
pub fn standard_parsers(config: &FingerprintConfig) -> Vec<Box<dyn FeatureParser>> {
    vec![
        Box::new(ReachabilityParser {
            sentinels: config.sentinels,
        }),
        Box::new(PortScanParser {
            scan_start: config.probes.scan_start,
            scan_end: config.probes.scan_end,
        }),
        Box::new(TcpProbeParser {
            syn_count: config.probes.syn_count,
        }),
        Box::new(HttpProbeParser {
            sentinels: config.sentinels,
            inspection: config.http.clone(),
            marker_header: config.probes.marker_header_name(),
        }),
    ]
}

#[derive(Debug, Default)]
struct PingStats {
    replies: usize,
    first_ttl: Option<u8>,
    loss: Option<f64>,
    avg_rtt: Option<f64>,
}

fn is_echo_reply(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("ttl=") && (lower.contains("bytes from") || lower.contains("reply from"))
}

fn ping_stats(text: &str) -> PingStats {
    let mut stats = PingStats::default();
    let mut reply_times = Vec::new();

    for line in text.lines().filter(|l| is_echo_reply(l)) {
        stats.replies += 1;
        if stats.first_ttl.is_none() {
            stats.first_ttl = TTL
                .captures(line)
                .and_then(|c| c[1].parse::<u16>().ok())
                .map(|ttl| ttl.min(255) as u8);
        }
        if let Some(t) = REPLY_TIME.captures(line).and_then(|c| c[1].parse::<f64>().ok()) {
            reply_times.push(t);
        }
    }

    stats.loss = LOSS
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|pct| (pct / 100.0).clamp(0.0, 1.0))
        .or_else(|| {
            let caps = TX_RX.captures(text)?;
            let sent: f64 = caps[1].parse().ok()?;
            let received: f64 = caps[2].parse().ok()?;
            (sent > 0.0).then(|| (1.0 - received / sent).clamp(0.0, 1.0))
        });

    stats.avg_rtt = RTT_SUMMARY
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .or_else(|| (!reply_times.is_empty()).then(|| reply_times.iter().mean()));

    stats
}

pub fn parse_reachability(outcome: &ProbeOutcome, sentinels: &Sentinels) -> ReachabilityFeatures {
    let raw = match outcome {
        Ok(raw) => raw,
        Err(_) => return ReachabilityFeatures::unreachable(sentinels),
    };
    let transcript = Transcript::parse(&raw.text);
    let primary = transcript
        .section(transcript::PING)
        .or_else(|| transcript.section(""))
        .unwrap_or_default();

    let stats = ping_stats(primary);
    if stats.replies == 0 {
        return ReachabilityFeatures::unreachable(sentinels);
    }

    let mut packet_loss = stats.loss.unwrap_or(0.0);
    if let Some(large_loss) = transcript
        .section(transcript::PING_LARGE)
        .and_then(|text| ping_stats(text).loss)
    {
        packet_loss = packet_loss.max(large_loss);
    }

    ReachabilityFeatures {
        avg_latency: stats
            .avg_rtt
            .unwrap_or(sentinels.unreachable_latency_ms),
        packet_loss,
        ttl_return: stats.first_ttl.unwrap_or(0),
        icmp_reachable: true,
    }
}

pub fn parse_port_scan(outcome: &ProbeOutcome, scan_start: u16, scan_end: u16) -> PortScanFeatures {
    let raw = match outcome {
        Ok(raw) => raw,
        Err(_) => return PortScanFeatures::UNSCANNED,
    };
    let text = &raw.text;
    let lower = text.to_lowercase();
    if !(lower.contains("nmap scan report") || lower.contains("nmap done") || FILTERED_PORT.is_match(text)) {
        return PortScanFeatures::UNSCANNED;
    }

    let range = scan_start as u32..=scan_end as u32;
    let listed: HashSet<u32> = FILTERED_PORT
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .filter(|port| range.contains(port))
        .collect();
    let collapsed: u32 = NOT_SHOWN_FILTERED
        .captures_iter(text)
        .chain(ALL_FILTERED.captures_iter(text))
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0);

    let range_size = scan_end as u32 - scan_start as u32 + 1;
    let filtered = (listed.len() as u32 + collapsed).min(range_size);

    let scan_time = SCAN_DURATION
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or_else(|| raw.elapsed.as_secs_f64());

    PortScanFeatures {
        filtered_ports_count: filtered,
        scan_time,
    }
}

fn reply_flags(text: &str) -> impl Iterator<Item = &str> {
    HPING_FLAGS
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

fn sent_count(text: &str, fallback: u32) -> f64 {
    HPING_SENT
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(fallback.max(1)) as f64
}

pub fn parse_tcp_probe(outcome: &ProbeOutcome, syn_count: u32) -> TcpFeatures {
    let raw = match outcome {
        Ok(raw) => raw,
        Err(_) => return TcpFeatures::SILENT,
    };
    let transcript = Transcript::parse(&raw.text);

    let syn_ack_ratio = transcript
        .section(transcript::SYN_APP)
        .map(|text| {
            let answered = reply_flags(text)
                .filter(|f| f.contains('S') && f.contains('A'))
                .count();
            (answered as f64 / sent_count(text, syn_count)).clamp(0.0, 1.0)
        })
        .unwrap_or(0.0);

    let tcp_reset_ratio = transcript
        .section(transcript::SYN_CONTROL)
        .map(|text| {
            let resets = reply_flags(text).filter(|f| f.contains('R')).count();
            (resets as f64 / sent_count(text, syn_count)).clamp(0.0, 1.0)
        })
        .unwrap_or(0.0);

    TcpFeatures {
        syn_ack_ratio,
        tcp_reset_ratio,
    }
}

fn header_names(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("HTTP/"))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, _)| name.trim().to_lowercase())
        .filter(|name| !name.is_empty() && !name.contains(' '))
        .collect()
}

fn curl_time_ms(text: &str) -> Option<f64> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| !line.contains(':'))
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| secs * 1000.0)
}

pub fn parse_http_probe(
    outcome: &ProbeOutcome,
    inspection: &HttpInspection,
    marker_header: &str,
    sentinels: &Sentinels,
) -> HttpFeatures {
    let raw = match outcome {
        Ok(raw) => raw,
        Err(_) => return HttpFeatures::no_response(sentinels),
    };
    let transcript = Transcript::parse(&raw.text);
    let direct = transcript
        .section(transcript::HTTP_HEADERS)
        .or_else(|| transcript.section(""))
        .filter(|text| text.contains("HTTP/"));

    let indicates_proxy = |name: &str| {
        inspection
            .proxy_indicators
            .iter()
            .any(|indicator| name.contains(indicator.as_str()))
    };

    let mut header_modified = false;
    let response_time = match direct {
        Some(text) => {
            header_modified = header_names(text).iter().any(|name| {
                indicates_proxy(name)
                    || (name != marker_header
                        && !inspection.clean_headers.iter().any(|clean| clean == name))
            });
            curl_time_ms(text).unwrap_or_else(|| raw.elapsed.as_secs_f64() * 1000.0)
        }
        None => sentinels.no_response_time_ms,
    };

    if !header_modified {
        header_modified = transcript
            .sections()
            .filter(|(label, _)| label.starts_with(transcript::HTTP_PROXY_PREFIX))
            .any(|(_, text)| indicates_proxy(&text.to_lowercase()));
    }

    HttpFeatures {
        response_time,
        header_modified,
    }
}
