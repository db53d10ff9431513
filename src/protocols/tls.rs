//! TLS ClientHello decoding for Sift
//!
//! Extracts the Server Name Indication from the first handshake record of a
//! TLS connection. Parsing walks the ClientHello with explicit offsets and
//! never reads past the payload slice.

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Extension number for server_name.
const EXTENSION_SNI: u16 = 0x0000;
/// server_name list entry type for a DNS hostname.
const SNI_TYPE_HOSTNAME: u8 = 0x00;

/// Longest hostname accepted from the server_name extension.
pub const MAX_SNI_LENGTH: usize = 255;

fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    (u16::from(data[offset]) << 8) | u16::from(data[offset + 1])
}

/// Check whether a payload starts with a plausible TLS ClientHello record:
/// handshake content type, a known protocol version, a record length that
/// fits in the payload, and a ClientHello handshake type.
pub fn is_client_hello(payload: &[u8]) -> bool {
    if payload.len() < 9 {
        return false;
    }

    if payload[0] != CONTENT_TYPE_HANDSHAKE {
        return false;
    }

    let version: u16 = read_u16_be(payload, 1);
    if !(0x0300..=0x0304).contains(&version) {
        return false;
    }

    let record_length = read_u16_be(payload, 3) as usize;
    if record_length > payload.len() - 5 {
        return false;
    }

    payload[5] == HANDSHAKE_CLIENT_HELLO
}

/// Extract the SNI hostname from a TLS ClientHello, if present.
///
/// Walks the handshake body: client version, random, session id, cipher
/// suites, and compression methods are skipped by their declared lengths,
/// then the extension list is scanned for a server_name entry of hostname
/// type. Every length field is validated against the remaining payload
/// before it is trusted.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    if !is_client_hello(payload) {
        return None;
    }

    let len: usize = payload.len();

    // Record header (5) + handshake header (4)
    let mut offset: usize = 5 + 4;

    // Client version (2) + random (32)
    offset += 2 + 32;

    let session_id_length = *payload.get(offset)? as usize;
    offset += 1 + session_id_length;

    if offset + 2 > len {
        return None;
    }
    let cipher_suites_length = read_u16_be(payload, offset) as usize;
    offset += 2 + cipher_suites_length;

    let compression_methods_length = *payload.get(offset)? as usize;
    offset += 1 + compression_methods_length;

    if offset + 2 > len {
        return None;
    }
    let extensions_length = read_u16_be(payload, offset) as usize;
    offset += 2;

    let extensions_end: usize = usize::min(offset + extensions_length, len);

    while offset + 4 <= extensions_end {
        let extension_type: u16 = read_u16_be(payload, offset);
        let extension_length = read_u16_be(payload, offset + 2) as usize;
        offset += 4;

        if offset + extension_length > extensions_end {
            break;
        }

        if extension_type == EXTENSION_SNI {
            // server_name_list: list length (2), name type (1), name length (2)
            if extension_length < 5 {
                break;
            }

            let list_length = read_u16_be(payload, offset) as usize;
            if list_length < 3 {
                break;
            }

            let name_type: u8 = payload[offset + 2];
            let name_length = read_u16_be(payload, offset + 3) as usize;

            if name_type != SNI_TYPE_HOSTNAME {
                break;
            }
            if name_length > extension_length - 5 || name_length > MAX_SNI_LENGTH {
                break;
            }

            let name_bytes: &[u8] = &payload[offset + 5..offset + 5 + name_length];
            return String::from_utf8(name_bytes.to_vec()).ok();
        }

        offset += extension_length;
    }

    None
}
