//! Display helpers and host-list handling.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::service::NodeInfo;

/// Human-readable byte count, e.g. "1.50 GB".
pub fn byte_desc(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TB", 1 << 40),
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("KB", 1 << 10),
    ];
    for (unit, scale) in UNITS {
        if bytes >= scale {
            return format!("{:.2} {}", bytes as f64 / scale as f64, unit);
        }
    }
    format!("{} B", bytes)
}

/// Human-readable elapsed time, e.g. "3.2 minutes".
pub fn time_desc(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1_000 {
        format!("{} milliseconds", ms)
    } else if ms < 60_000 {
        format!("{:.3} seconds", ms as f64 / 1_000.0)
    } else if ms < 3_600_000 {
        format!("{:.3} minutes", ms as f64 / 60_000.0)
    } else {
        format!("{:.3} hours", ms as f64 / 3_600_000.0)
    }
}

/// Parse a comma-separated host list, trimming whitespace and dropping empty
/// entries.
pub fn parse_host_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a host set from a file, one host per line. Blank lines and
/// surrounding whitespace are ignored.
pub fn read_host_file(path: &Path) -> Result<HashSet<String>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::HostFile {
        path: path.display().to_string(),
        source,
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// True if the node matches any entry in the set. Entries match the node's
/// hostname or IP address, with or without the transfer port.
pub fn host_set_matches(set: &HashSet<String>, node: &NodeInfo) -> bool {
    host_matches(set, &node.hostname, node.transfer_port)
        || host_matches(set, &node.ip_addr, node.transfer_port)
}

fn host_matches(set: &HashSet<String>, host: &str, port: u16) -> bool {
    if host.is_empty() {
        return false;
    }
    set.contains(host) || set.contains(&format!("{}:{}", host, port))
}
