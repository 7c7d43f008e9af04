//! Network probe helpers
//!
//! Best-effort discovery of the machine's LAN identity: primary IPv4,
//! interface name, /24 segment and reachability. Nothing here is fatal;
//! anything that cannot be determined is reported as the literal string
//! "Unknown".

use std::net::{Ipv4Addr, TcpListener};

use ipnet::Ipv4Net;
use tokio::net::lookup_host;
use tracing::debug;

/// Interfaces tried first when picking the primary LAN address
const PREFERRED_INTERFACES: [&str; 4] = ["en0", "en1", "eth0", "wlan0"];

/// Hostname resolved to judge online-ness
const CONNECTIVITY_PROBE: &str = "apple.com:443";

/// How many ports a dynamic scan may try
const PORT_SCAN_RANGE: u16 = 10;

/// Snapshot of the local network identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Primary LAN IPv4, or "Unknown"
    pub ip_address: String,
    /// Name of the interface the primary address came from, or "Unknown"
    pub interface_name: String,
    /// Textual /24 segment of the primary address, or "Unknown"
    pub network_segment: String,
    /// Whether a well-known hostname resolved
    pub is_online: bool,
}

impl NetworkInfo {
    /// Parsed primary address, when one was found
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.ip_address.parse().ok()
    }
}

/// Gather the local network snapshot
pub async fn probe() -> NetworkInfo {
    let primary = primary_interface();
    let is_online = lookup_host(CONNECTIVITY_PROBE).await.is_ok();

    match primary {
        Some((name, ip)) => NetworkInfo {
            ip_address: ip.to_string(),
            network_segment: segment_of(ip),
            interface_name: name,
            is_online,
        },
        None => {
            debug!("No non-loopback IPv4 interface found");
            NetworkInfo {
                ip_address: "Unknown".to_string(),
                interface_name: "Unknown".to_string(),
                network_segment: "Unknown".to_string(),
                is_online,
            }
        }
    }
}

/// Pick the primary interface: preference order first, then the first
/// non-loopback IPv4.
fn primary_interface() -> Option<(String, Ipv4Addr)> {
    let candidates: Vec<(String, Ipv4Addr)> = if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) if !v4.ip.is_loopback() => Some((iface.name, v4.ip)),
            _ => None,
        })
        .collect();

    for preferred in PREFERRED_INTERFACES {
        if let Some(found) = candidates.iter().find(|(name, _)| name == preferred) {
            return Some(found.clone());
        }
    }
    candidates.into_iter().next()
}

/// Textual /24 network segment for an address (informational only)
fn segment_of(ip: Ipv4Addr) -> String {
    match Ipv4Net::new(ip, 24) {
        Ok(net) => net.trunc().to_string(),
        Err(_) => "Unknown".to_string(),
    }
}

/// Whether a port can be bound on all interfaces
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Find the first free port in `[start, start + 10)`
pub fn find_available_port(start: u16) -> Option<u16> {
    (start..start.saturating_add(PORT_SCAN_RANGE)).find(|&port| is_port_available(port))
}

/// The advertised WebSocket URL for an address and port
pub fn websocket_url(ip: &str, port: u16) -> String {
    format!("ws://{}:{}", ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_truncates_to_slash_24() {
        assert_eq!(segment_of(Ipv4Addr::new(192, 168, 4, 87)), "192.168.4.0/24");
    }

    #[test]
    fn websocket_url_format() {
        assert_eq!(websocket_url("10.0.0.2", 8765), "ws://10.0.0.2:8765");
    }

    #[test]
    fn find_available_port_skips_bound_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        let found = find_available_port(taken).expect("a free port within the scan range");
        assert_ne!(found, taken);
        assert!(found > taken && found < taken + PORT_SCAN_RANGE);
    }

    #[tokio::test]
    async fn probe_never_fails() {
        let info = probe().await;
        assert!(!info.ip_address.is_empty());
        assert!(!info.network_segment.is_empty());
    }
}
