//! `FEATURE_NAMES` fixes column order for datasets, matrices and stored
//! models. Reordering it invalidates existing models.

use serde::{Deserialize, Serialize};

use crate::config::Sentinels;

pub const FEATURE_COUNT: usize = 10;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "avg_latency",          // 0: mean ICMP round trip, ms
    "packet_loss",          // 1: fraction of echoes lost, 0..1
    "ttl_return",           // 2: TTL of first echo reply
    "icmp_reachable",       // 3: any echo reply seen
    "filtered_ports_count", // 4: filtered ports in the scan range
    "scan_time",            // 5: port scan duration, s
    "syn_ack_ratio",        // 6: SYN/ACK answers on the application port
    "tcp_reset_ratio",      // 7: RST answers on the control port
    "response_time",        // 8: HTTP round trip, ms
    "header_modified",      // 9: intermediary-added response header seen
];

pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub avg_latency: f64,
    pub packet_loss: f64,
    pub ttl_return: u8,
    pub icmp_reachable: bool,
    pub filtered_ports_count: u32,
    pub scan_time: f64,
    pub syn_ack_ratio: f64,
    pub tcp_reset_ratio: f64,
    pub response_time: f64,
    pub header_modified: bool,
}

impl FeatureVector {
    pub fn all_sentinel(sentinels: &Sentinels) -> Self {
        Self {
            avg_latency: sentinels.unreachable_latency_ms,
            packet_loss: 1.0,
            ttl_return: 0,
            icmp_reachable: false,
            filtered_ports_count: 0,
            scan_time: 0.0,
            syn_ack_ratio: 0.0,
            tcp_reset_ratio: 0.0,
            response_time: sentinels.no_response_time_ms,
            header_modified: false,
        }
    }

    /// Values in `FEATURE_NAMES` order.
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.avg_latency,
            self.packet_loss,
            self.ttl_return as f64,
            bool_value(self.icmp_reachable),
            self.filtered_ports_count as f64,
            self.scan_time,
            self.syn_ack_ratio,
            self.tcp_reset_ratio,
            self.response_time,
            bool_value(self.header_modified),
        ]
    }

    /// Inverse of [`to_array`](Self::to_array); rejects values outside each
    /// field's domain.
    pub fn from_array(values: &[f64]) -> Result<Self, String> {
        if values.len() != FEATURE_COUNT {
            return Err(format!(
                "expected {} feature values, got {}",
                FEATURE_COUNT,
                values.len()
            ));
        }
        if let Some((i, v)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(format!("{} is not finite ({})", FEATURE_NAMES[i], v));
        }

        let ratio = |i: usize| -> Result<f64, String> {
            let v = values[i];
            if (0.0..=1.0).contains(&v) {
                Ok(v)
            } else {
                Err(format!("{} must be within 0..1, got {}", FEATURE_NAMES[i], v))
            }
        };
        let flag = |i: usize| -> Result<bool, String> {
            match values[i] {
                v if v == 0.0 => Ok(false),
                v if v == 1.0 => Ok(true),
                v => Err(format!("{} must be 0 or 1, got {}", FEATURE_NAMES[i], v)),
            }
        };
        let integer = |i: usize, max: f64| -> Result<f64, String> {
            let v = values[i];
            if v.fract() == 0.0 && (0.0..=max).contains(&v) {
                Ok(v)
            } else {
                Err(format!("{} must be an integer in 0..={}, got {}", FEATURE_NAMES[i], max, v))
            }
        };

        Ok(Self {
            avg_latency: values[0],
            packet_loss: ratio(1)?,
            ttl_return: integer(2, 255.0)? as u8,
            icmp_reachable: flag(3)?,
            filtered_ports_count: integer(4, u32::MAX as f64)? as u32,
            scan_time: values[5],
            syn_ack_ratio: ratio(6)?,
            tcp_reset_ratio: ratio(7)?,
            response_time: values[8],
            header_modified: flag(9)?,
        })
    }
}

fn bool_value(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}
