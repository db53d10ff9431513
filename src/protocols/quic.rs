//! QUIC initial-packet probing for Sift
//!
//! QUIC carries its ClientHello inside protected Initial packets, so a full
//! decode would need the QUIC key schedule. This probe only recognizes the
//! long-header form and scans for a plaintext ClientHello, which surfaces in
//! practice for some implementations and test captures. False negatives are
//! expected; downstream classification tolerates them.

use crate::protocols::tls;

/// Check for the QUIC long-header form (most significant bit of the first
/// byte set).
pub fn is_long_header(payload: &[u8]) -> bool {
    if payload.len() < 5 {
        return false;
    }
    payload[0] & 0x80 != 0
}

/// Best-effort SNI extraction from a QUIC long-header packet.
///
/// Scans for a ClientHello handshake-type byte and retries the TLS record
/// decode five bytes earlier, where the record header would sit.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    if !is_long_header(payload) {
        return None;
    }

    for i in 5..payload.len().saturating_sub(50) {
        if payload[i] == 0x01 {
            if let Some(sni) = tls::extract_sni(&payload[i - 5..]) {
                return Some(sni);
            }
        }
    }

    None
}
