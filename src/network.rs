use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::Path;

use ipnet::IpNet;

use crate::error::{FwError, Result};

const MAX_RANGE: u32 = 1024;

/// Expands a comma separated target list. Each item is an IPv4 address, a
/// hostname, an `a-b` range or a CIDR block. First occurrence wins;
/// order is kept. IPv6 is refused: the probe tools are driven in their
/// IPv4 modes.
pub fn parse_targets(target_spec: &str) -> Result<Vec<IpAddr>> {
    let mut targets = Vec::new();

    for part in target_spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part.contains('/') {
            targets.extend(parse_cidr(part)?);
        } else if part.contains('-') && looks_like_range(part) {
            targets.extend(parse_ip_range(part)?);
        } else {
            targets.push(parse_single_target(part)?);
        }
    }

    Ok(dedup_in_order(targets))
}

/// Targets from several specs plus an optional file, one spec per line.
/// Blank lines and `#` comments are skipped.
pub fn collect_targets(specs: &[String], file: Option<&Path>) -> Result<Vec<IpAddr>> {
    let mut targets = Vec::new();
    for spec in specs {
        targets.extend(parse_targets(spec)?);
    }
    if let Some(path) = file {
        targets.extend(read_targets_file(path)?);
    }
    if targets.is_empty() {
        return Err(FwError::InvalidTarget("no targets given".into()));
    }
    Ok(dedup_in_order(targets))
}

pub fn read_targets_file(path: &Path) -> Result<Vec<IpAddr>> {
    let content = fs::read_to_string(path)
        .map_err(|e| FwError::InvalidTarget(format!("{}: {}", path.display(), e)))?;
    let mut targets = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if !line.is_empty() {
            targets.extend(parse_targets(line)?);
        }
    }
    Ok(targets)
}

fn dedup_in_order(targets: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    targets.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

/// Hostnames may contain dashes; a range needs an address on both sides.
fn looks_like_range(part: &str) -> bool {
    part.split_once('-')
        .map(|(a, _)| a.trim().parse::<IpAddr>().is_ok())
        .unwrap_or(false)
}

fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    let network: IpNet = cidr
        .parse()
        .map_err(|_| FwError::InvalidTarget(format!("invalid CIDR notation: {}", cidr)))?;

    match network {
        IpNet::V4(net) => {
            if net.prefix_len() < 32 - MAX_RANGE.trailing_zeros() as u8 {
                return Err(FwError::InvalidTarget(format!(
                    "CIDR block {} too large (max {} addresses)",
                    cidr, MAX_RANGE
                )));
            }
            Ok(net.hosts().map(IpAddr::V4).collect())
        }
        IpNet::V6(_) => Err(ipv6_unsupported(cidr)),
    }
}

fn parse_ip_range(range: &str) -> Result<Vec<IpAddr>> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| FwError::InvalidTarget(format!("invalid IP range format: {}", range)))?;

    let start_ip: IpAddr = start
        .trim()
        .parse()
        .map_err(|_| FwError::InvalidTarget(format!("invalid start IP: {}", start)))?;
    let end_ip: IpAddr = end
        .trim()
        .parse()
        .map_err(|_| FwError::InvalidTarget(format!("invalid end IP: {}", end)))?;

    match (start_ip, end_ip) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let start_u32 = u32::from(start);
            let end_u32 = u32::from(end);

            if start_u32 > end_u32 {
                return Err(FwError::InvalidTarget(
                    "start IP must be less than or equal to end IP".into(),
                ));
            }
            if end_u32 - start_u32 >= MAX_RANGE {
                return Err(FwError::InvalidTarget(format!(
                    "IP range too large (max {} addresses)",
                    MAX_RANGE
                )));
            }

            Ok((start_u32..=end_u32)
                .map(|ip| IpAddr::V4(Ipv4Addr::from(ip)))
                .collect())
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => Err(ipv6_unsupported(range)),
        _ => Err(FwError::InvalidTarget(
            "start and end IP must be the same version".into(),
        )),
    }
}

fn parse_single_target(target: &str) -> Result<IpAddr> {
    match target.parse::<IpAddr>() {
        Ok(ip @ IpAddr::V4(_)) => return Ok(ip),
        Ok(IpAddr::V6(_)) => return Err(ipv6_unsupported(target)),
        Err(_) => {}
    }

    let addr = format!("{}:0", target)
        .to_socket_addrs()
        .map_err(|_| FwError::InvalidTarget(format!("failed to resolve hostname: {}", target)))?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| {
            FwError::InvalidTarget(format!("no IPv4 address found for hostname: {}", target))
        })?;

    Ok(addr.ip())
}

fn ipv6_unsupported(target: &str) -> FwError {
    FwError::InvalidTarget(format!("IPv6 targets are not supported: {}", target))
}
