//! Utilities module for Sift
//!
//! This module contains common helpers for logging and value formatting.

pub mod logger;

use std::net::Ipv4Addr;
use std::time::Duration;

/// Format an IPv4 address held as a network-order u32 as a dotted quad.
pub fn ipv4_to_string(ip: u32) -> String {
    Ipv4Addr::from(ip).to_string()
}

/// Parse a dotted-quad IPv4 address into its network-order u32 form.
pub fn parse_ipv4(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Format a MAC address as six colon-separated hex octets.
pub fn mac_to_string(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Format a duration as a clock string, millisecond precision. The hours
/// field only appears once the duration reaches one.
pub fn format_duration(duration: Duration) -> String {
    let millis: u128 = duration.as_millis();
    let seconds: u128 = millis / 1_000;

    let clock: String = format!(
        "{:02}:{:02}.{:03}",
        (seconds / 60) % 60,
        seconds % 60,
        millis % 1_000
    );

    match seconds / 3_600 {
        0 => clock,
        hours => format!("{:02}:{}", hours, clock),
    }
}

/// Format a size in bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip() {
        let ip: u32 = parse_ipv4("10.0.0.1").unwrap();
        assert_eq!(ipv4_to_string(ip), "10.0.0.1");
        assert_eq!(parse_ipv4("256.0.0.1"), None);
        assert_eq!(parse_ipv4("not-an-ip"), None);
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(62_345)), "01:02.345");
        assert_eq!(format_duration(Duration::from_secs(3_723)), "01:02:03.000");
        assert_eq!(format_duration(Duration::ZERO), "00:00.000");
    }
}
