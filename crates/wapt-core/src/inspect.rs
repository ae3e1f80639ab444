//! Read-only views of a running AP: DHCP leases and associated stations.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, WaptError};
use crate::mac::MacAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub expires: Option<DateTime<Utc>>,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub client_id: Option<String>,
}

/// Parses a dnsmasq lease file: `<expiry> <mac> <ip> <hostname> <client-id>`,
/// `*` meaning absent. Expiry `0` is an infinite lease. Unparseable lines
/// are skipped.
pub fn parse_leases(text: &str) -> Vec<Lease> {
    text.lines().filter_map(parse_lease_line).collect()
}

fn parse_lease_line(line: &str) -> Option<Lease> {
    let mut fields = line.split_whitespace();
    let expiry: i64 = fields.next()?.parse().ok()?;
    let mac: MacAddr = fields.next()?.parse().ok()?;
    let ip: Ipv4Addr = fields.next()?.parse().ok()?;
    let optional = |v: Option<&str>| v.filter(|s| *s != "*").map(str::to_string);
    let hostname = optional(fields.next());
    let client_id = optional(fields.next());

    let expires = if expiry == 0 {
        None
    } else {
        DateTime::<Utc>::from_timestamp(expiry, 0)
    };
    Some(Lease {
        expires,
        mac,
        ip,
        hostname,
        client_id,
    })
}

/// A missing lease file means no clients yet.
pub fn read_leases(path: &Path) -> Result<Vec<Lease>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_leases(&text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(WaptError::io(format!("reading {}", path.display()), err)),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Station {
    pub mac: MacAddr,
    pub signal_dbm: Option<i32>,
    pub connected_secs: Option<u64>,
    pub inactive_ms: Option<u64>,
}

/// Parses `iw dev <if> station dump`.
pub fn parse_station_dump(text: &str) -> Vec<Station> {
    let mut stations = Vec::new();
    let mut current: Option<Station> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Station ") {
            if let Some(done) = current.take() {
                stations.push(done);
            }
            current = rest
                .split_whitespace()
                .next()
                .and_then(|mac| mac.parse().ok())
                .map(|mac| Station {
                    mac,
                    ..Station::default()
                });
            continue;
        }

        let Some(station) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let first = value.split_whitespace().next().unwrap_or("");
        match key.trim() {
            "signal" => station.signal_dbm = first.parse().ok(),
            "connected time" => station.connected_secs = first.parse().ok(),
            "inactive time" => station.inactive_ms = first.parse().ok(),
            _ => {}
        }
    }
    if let Some(done) = current {
        stations.push(done);
    }
    stations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_lines() {
        let text = "\
1700000000 aa:bb:cc:dd:ee:01 10.0.0.23 phone 01:aa:bb:cc:dd:ee:01
0 aa:bb:cc:dd:ee:02 10.0.0.24 * *
garbage line
";
        let leases = parse_leases(text);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hostname.as_deref(), Some("phone"));
        assert_eq!(leases[0].ip, Ipv4Addr::new(10, 0, 0, 23));
        assert!(leases[0].expires.is_some());
        assert_eq!(leases[1].expires, None);
        assert_eq!(leases[1].hostname, None);
        assert_eq!(leases[1].client_id, None);
    }

    #[test]
    fn missing_lease_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_leases(&dir.path().join("none")).unwrap().is_empty());
    }

    #[test]
    fn station_dump() {
        let dump = "\
Station aa:bb:cc:dd:ee:01 (on wlan0)
\tinactive time:\t120 ms
\trx bytes:\t10312
\tsignal:  \t-48 [-50, -51] dBm
\tconnected time:\t75 seconds
Station aa:bb:cc:dd:ee:02 (on wlan0)
\tsignal:  \t-70 dBm
";
        let stations = parse_station_dump(dump);
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].signal_dbm, Some(-48));
        assert_eq!(stations[0].connected_secs, Some(75));
        assert_eq!(stations[0].inactive_ms, Some(120));
        assert_eq!(stations[1].mac.to_string(), "aa:bb:cc:dd:ee:02");
        assert_eq!(stations[1].connected_secs, None);
        assert!(parse_station_dump("").is_empty());
    }
}
