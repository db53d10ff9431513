//! DNS query decoding for Sift
//!
//! Extracts the first query name from a DNS message. Only plain questions
//! are accepted; compression pointers never legitimately appear in the
//! question section of a query and cause a rejection.

/// Fixed DNS header size.
const HEADER_LEN: usize = 12;
/// Longest single label permitted by the wire format.
const MAX_LABEL_LEN: usize = 63;
/// Label count guard against degenerate messages.
pub const MAX_LABEL_DEPTH: usize = 50;
/// Longest assembled name accepted.
pub const MAX_NAME_LENGTH: usize = 255;

/// Check whether a payload looks like a DNS query: full header, QR bit
/// clear, and at least one question.
pub fn is_dns_query(payload: &[u8]) -> bool {
    if payload.len() < HEADER_LEN {
        return false;
    }

    // QR bit set means a response.
    if payload[2] & 0x80 != 0 {
        return false;
    }

    let qdcount: u16 = (u16::from(payload[4]) << 8) | u16::from(payload[5]);
    qdcount >= 1
}

/// Extract the first query name from a DNS query payload, labels joined
/// with dots.
pub fn extract_query(payload: &[u8]) -> Option<String> {
    if !is_dns_query(payload) {
        return None;
    }

    let mut name = String::new();
    let mut offset: usize = HEADER_LEN;
    let mut depth: usize = 0;

    while offset < payload.len() {
        let label_len = payload[offset] as usize;

        if label_len == 0 {
            break;
        }

        // Compression pointers (top two bits set) are invalid in a query's
        // question section; anything else above 63 is malformed.
        if label_len > MAX_LABEL_LEN {
            return None;
        }

        depth += 1;
        if depth > MAX_LABEL_DEPTH {
            return None;
        }

        offset += 1;
        if offset + label_len > payload.len() {
            return None;
        }

        if !name.is_empty() {
            name.push('.');
        }
        if name.len() + label_len > MAX_NAME_LENGTH {
            return None;
        }
        name.push_str(&String::from_utf8_lossy(&payload[offset..offset + label_len]));

        offset += label_len;
    }

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a DNS query message for the given name (A record, IN class).
    pub(crate) fn query_for(name: &str) -> Vec<u8> {
        let mut msg: Vec<u8> = Vec::new();
        msg.extend_from_slice(&0x1234u16.to_be_bytes()); // transaction id
        msg.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: RD, QR clear
        msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        msg.extend_from_slice(&[0; 6]); // an/ns/ar counts
        for label in name.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&1u16.to_be_bytes()); // qtype A
        msg.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
        msg
    }

    #[test]
    fn extracts_query_name() {
        let msg = query_for("example.com");
        assert_eq!(extract_query(&msg).as_deref(), Some("example.com"));
    }

    #[test]
    fn rejects_responses() {
        let mut msg = query_for("example.com");
        msg[2] |= 0x80;
        assert_eq!(extract_query(&msg), None);
    }

    #[test]
    fn rejects_zero_question_count() {
        let mut msg = query_for("example.com");
        msg[4] = 0;
        msg[5] = 0;
        assert_eq!(extract_query(&msg), None);
    }

    #[test]
    fn label_length_boundary() {
        let long_label = "a".repeat(63);
        let msg = query_for(&format!("{}.com", long_label));
        assert_eq!(
            extract_query(&msg).as_deref(),
            Some(format!("{}.com", long_label).as_str())
        );

        // A 64-byte length octet collides with the compression-pointer
        // encoding and is rejected.
        let mut bad = query_for("aaaa.com");
        bad[HEADER_LEN] = 64;
        assert_eq!(extract_query(&bad), None);
    }

    #[test]
    fn rejects_compression_pointer() {
        let mut msg = query_for("example.com");
        msg[HEADER_LEN] = 0xC0;
        msg[HEADER_LEN + 1] = 0x04;
        assert_eq!(extract_query(&msg), None);
    }

    #[test]
    fn rejects_truncated_label() {
        let mut msg = query_for("example.com");
        msg.truncate(HEADER_LEN + 4);
        assert_eq!(extract_query(&msg), None);
    }
}
