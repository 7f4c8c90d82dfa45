pub mod command;
pub mod transcript;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::CommandProbeAdapter;
pub use transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    Reachability,
    PortScan,
    TcpProbe,
    HttpProbe,
}

impl ProbeKind {
    /// Probe execution order used by the extractor.
    pub const ALL: [ProbeKind; 4] = [
        ProbeKind::Reachability,
        ProbeKind::PortScan,
        ProbeKind::TcpProbe,
        ProbeKind::HttpProbe,
    ];
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Reachability => write!(f, "reachability"),
            ProbeKind::PortScan => write!(f, "port-scan"),
            ProbeKind::TcpProbe => write!(f, "tcp-probe"),
            ProbeKind::HttpProbe => write!(f, "http-probe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout(Duration),
    ToolMissing(String),
    PermissionDenied,
    /// Tool ran but exited non-zero or produced nothing usable.
    Unreachable(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout(after) => write!(f, "timed out after {:.1}s", after.as_secs_f64()),
            FailureReason::ToolMissing(tool) => write!(f, "tool missing: {}", tool),
            FailureReason::PermissionDenied => write!(f, "permission denied"),
            FailureReason::Unreachable(detail) => write!(f, "target unreachable ({})", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} probe failed: {reason}")]
pub struct ProbeFailure {
    pub kind: ProbeKind,
    pub reason: FailureReason,
}

impl ProbeFailure {
    pub fn new(kind: ProbeKind, reason: FailureReason) -> Self {
        Self { kind, reason }
    }

    /// Whether the failure points at the local environment rather than the target.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self.reason,
            FailureReason::ToolMissing(_) | FailureReason::PermissionDenied
        )
    }
}

/// Raw text captured from one probe run plus its wall-clock duration.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub text: String,
    pub elapsed: Duration,
}

impl RawOutput {
    pub fn new(text: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            text: text.into(),
            elapsed,
        }
    }
}

pub type ProbeOutcome = std::result::Result<RawOutput, ProbeFailure>;

/// Boundary to the external probing capability.
///
/// Implementations must bound every call by `timeout` and report failures as
/// [`ProbeFailure`] values instead of panicking or blocking. No retries happen
/// at this layer.
#[async_trait]
pub trait ProbeAdapter: Send + Sync {
    async fn run_probe(&self, kind: ProbeKind, target: IpAddr, timeout: Duration) -> ProbeOutcome;
}

#[async_trait]
impl<A: ProbeAdapter + ?Sized> ProbeAdapter for std::sync::Arc<A> {
    async fn run_probe(&self, kind: ProbeKind, target: IpAddr, timeout: Duration) -> ProbeOutcome {
        (**self).run_probe(kind, target, timeout).await
    }
}

pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
