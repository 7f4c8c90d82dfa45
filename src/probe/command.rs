use std::net::IpAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::transcript::{self, Transcript};
use super::{is_root, FailureReason, ProbeAdapter, ProbeFailure, ProbeKind, ProbeOutcome, RawOutput};
use crate::config::ProbeSettings;

pub const REQUIRED_TOOLS: [&str; 4] = ["ping", "nmap", "hping3", "curl"];

/// `ping` exits 1 when no reply came back; the summary is still printed.
const PING_NO_REPLY: i32 = 1;

/// Runs the stock command-line tools (`ping`, `nmap`, `hping3`, `curl`) and
/// hands their text back untouched.
pub struct CommandProbeAdapter {
    settings: ProbeSettings,
}

impl CommandProbeAdapter {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    async fn reachability(&self, target: IpAddr, deadline: Instant) -> ProbeOutcome {
        let kind = ProbeKind::Reachability;
        let count = self.settings.ping_count.to_string();
        let host = target.to_string();
        let start = Instant::now();

        let standard = self
            .run_tool(kind, "ping", &["-c", count.as_str(), host.as_str()], deadline)
            .await?;
        let mut transcript = Transcript::new().with(transcript::PING, standard.text);

        // Larger payloads expose fragmentation-sensitive filtering.
        let size = self.settings.large_ping_size.to_string();
        let args = ["-c", count.as_str(), "-s", size.as_str(), host.as_str()];
        match self
            .run_tool_accepting(kind, "ping", &args, deadline, &[PING_NO_REPLY])
            .await
        {
            Ok(large) => transcript.push(transcript::PING_LARGE, large.text),
            Err(failure) => debug!("large-packet ping against {} skipped: {}", target, failure),
        }

        Ok(RawOutput::new(transcript.render(), start.elapsed()))
    }

    async fn port_scan(&self, target: IpAddr, deadline: Instant) -> ProbeOutcome {
        // SYN scans need raw sockets; fall back to a connect scan otherwise.
        let technique = if is_root() { "-sS" } else { "-sT" };
        let range = format!("{}-{}", self.settings.scan_start, self.settings.scan_end);
        let host = target.to_string();
        self.run_tool(
            ProbeKind::PortScan,
            "nmap",
            &[technique, "-p", range.as_str(), host.as_str(), "-oN", "-"],
            deadline,
        )
        .await
    }

    async fn tcp_probe(&self, target: IpAddr, deadline: Instant) -> ProbeOutcome {
        let kind = ProbeKind::TcpProbe;
        let count = self.settings.syn_count.to_string();
        let host = target.to_string();
        let start = Instant::now();
        let mut transcript = Transcript::new();
        let mut first_failure = None;

        let runs = [
            (transcript::SYN_APP, self.settings.app_port),
            (transcript::SYN_CONTROL, self.settings.control_port),
        ];
        for (label, port) in runs {
            let port = port.to_string();
            match self
                .run_tool(kind, "hping3", &["-S", "-p", port.as_str(), "-c", count.as_str(), host.as_str()], deadline)
                .await
            {
                Ok(output) => transcript.push(label, output.text),
                Err(failure) => {
                    debug!("hping3 {} against {}:{} failed: {}", label, target, port, failure);
                    first_failure.get_or_insert(failure);
                }
            }
        }

        match first_failure {
            Some(failure) if transcript.is_empty() => Err(failure),
            _ => Ok(RawOutput::new(transcript.render(), start.elapsed())),
        }
    }

    async fn http_probe(&self, target: IpAddr, deadline: Instant) -> ProbeOutcome {
        let kind = ProbeKind::HttpProbe;
        let start = Instant::now();
        let url = format!("http://{}", target);
        let max_time = remaining(deadline)
            .map(|d| d.as_secs().max(1))
            .unwrap_or(1)
            .to_string();
        let mut transcript = Transcript::new();

        let direct = self
            .run_tool(
                kind,
                "curl",
                &[
                    "-s",
                    "-I",
                    "-H",
                    self.settings.marker_header.as_str(),
                    "-w",
                    "\n%{time_total}\n",
                    "--max-time",
                    max_time.as_str(),
                    url.as_str(),
                ],
                deadline,
            )
            .await;
        let direct_failure = match direct {
            Ok(output) => {
                transcript.push(transcript::HTTP_HEADERS, output.text);
                None
            }
            Err(failure) => Some(failure),
        };

        for port in &self.settings.proxy_ports {
            if remaining(deadline).is_none() {
                break;
            }
            let proxy = format!("http://{}:{}", target, port);
            if let Ok(output) = self
                .run_tool(
                    kind,
                    "curl",
                    &[
                        "-s",
                        "-I",
                        "-x",
                        proxy.as_str(),
                        self.settings.proxy_probe_url.as_str(),
                        "--connect-timeout",
                        "3",
                    ],
                    deadline,
                )
                .await
            {
                if !output.text.trim().is_empty() {
                    transcript.push(format!("{}{}", transcript::HTTP_PROXY_PREFIX, port), output.text);
                }
            }
        }

        match direct_failure {
            Some(failure) if transcript.is_empty() => Err(failure),
            _ => Ok(RawOutput::new(transcript.render(), start.elapsed())),
        }
    }

    async fn run_tool(
        &self,
        kind: ProbeKind,
        program: &str,
        args: &[&str],
        deadline: Instant,
    ) -> ProbeOutcome {
        self.run_tool_accepting(kind, program, args, deadline, &[]).await
    }

    /// Like `run_tool`, but the exit codes in `accepted` also count as success.
    async fn run_tool_accepting(
        &self,
        kind: ProbeKind,
        program: &str,
        args: &[&str],
        deadline: Instant,
        accepted: &[i32],
    ) -> ProbeOutcome {
        let budget = remaining(deadline).ok_or_else(|| {
            ProbeFailure::new(kind, FailureReason::Timeout(Duration::ZERO))
        })?;

        debug!("running: {} {}", program, args.join(" "));
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let output = match timeout(budget, command.output()).await {
            Err(_) => {
                debug!("{} timed out after {:?}", program, budget);
                return Err(ProbeFailure::new(kind, FailureReason::Timeout(budget)));
            }
            Ok(Err(e)) => {
                let reason = match e.kind() {
                    std::io::ErrorKind::NotFound => FailureReason::ToolMissing(program.to_string()),
                    std::io::ErrorKind::PermissionDenied => FailureReason::PermissionDenied,
                    _ => FailureReason::Unreachable(e.to_string()),
                };
                return Err(ProbeFailure::new(kind, reason));
            }
            Ok(Ok(output)) => output,
        };
        let elapsed = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let accepted = output.status.code().map_or(false, |code| accepted.contains(&code));
        if !output.status.success() && !accepted {
            let excerpt: String = stderr.chars().take(200).collect();
            debug!("{} exited with {}: {}", program, output.status, excerpt.trim());
            let reason = if looks_like_privilege_error(&stderr) {
                FailureReason::PermissionDenied
            } else {
                FailureReason::Unreachable(format!("{} exited with {}", program, output.status))
            };
            return Err(ProbeFailure::new(kind, reason));
        }

        // hping3 reports replies on stderr on some builds.
        let mut text = stdout.into_owned();
        if !stderr.trim().is_empty() {
            text.push_str(&stderr);
        }
        Ok(RawOutput::new(text, elapsed))
    }
}

#[async_trait]
impl ProbeAdapter for CommandProbeAdapter {
    async fn run_probe(&self, kind: ProbeKind, target: IpAddr, timeout: Duration) -> ProbeOutcome {
        if target.is_ipv6() {
            return Err(ProbeFailure::new(
                kind,
                FailureReason::Unreachable("IPv6 targets are not supported".into()),
            ));
        }
        let deadline = Instant::now() + timeout;
        match kind {
            ProbeKind::Reachability => self.reachability(target, deadline).await,
            ProbeKind::PortScan => self.port_scan(target, deadline).await,
            ProbeKind::TcpProbe => self.tcp_probe(target, deadline).await,
            ProbeKind::HttpProbe => self.http_probe(target, deadline).await,
        }
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

fn looks_like_privilege_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("requires root")
        || lower.contains("root privileges")
}

/// Returns the required tools that cannot be found on `PATH`.
pub fn missing_tools() -> Vec<String> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let dirs: Vec<_> = std::env::split_paths(&path).collect();
    REQUIRED_TOOLS
        .iter()
        .filter(|tool| !dirs.iter().any(|dir| dir.join(tool).is_file()))
        .map(|tool| tool.to_string())
        .collect()
}
