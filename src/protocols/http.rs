//! HTTP request decoding for Sift
//!
//! Recognizes plaintext HTTP/1.x requests and pulls the server identity out
//! of the Host header.

/// First four bytes of the request methods Sift recognizes.
const METHOD_PREFIXES: &[&[u8; 4]] = &[
    b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"PATC", b"OPTI",
];

/// Scan window for locating the Host header.
pub const MAX_HEADER_SCAN: usize = 16_384;

/// Check whether a payload begins with a known HTTP request method.
pub fn is_http_request(payload: &[u8]) -> bool {
    if payload.len() < 4 {
        return false;
    }
    METHOD_PREFIXES
        .iter()
        .any(|method| &payload[..4] == *method)
}

/// Extract the Host header value from an HTTP request payload.
///
/// The header name is matched case-insensitively, leading whitespace is
/// skipped, the value ends at the first CR or LF, and any `:port` suffix is
/// stripped.
pub fn extract_host(payload: &[u8]) -> Option<String> {
    if !is_http_request(payload) {
        return None;
    }

    let window: &[u8] = &payload[..payload.len().min(MAX_HEADER_SCAN)];
    let len: usize = window.len();

    let mut i: usize = 0;
    while i + 5 < len {
        if window[i].eq_ignore_ascii_case(&b'h')
            && window[i + 1].eq_ignore_ascii_case(&b'o')
            && window[i + 2].eq_ignore_ascii_case(&b's')
            && window[i + 3].eq_ignore_ascii_case(&b't')
            && window[i + 4] == b':'
        {
            let mut start: usize = i + 5;
            while start < len && (window[start] == b' ' || window[start] == b'\t') {
                start += 1;
            }

            let mut end: usize = start;
            while end < len && window[end] != b'\r' && window[end] != b'\n' {
                end += 1;
            }

            if end > start {
                let mut host = String::from_utf8_lossy(&window[start..end]).into_owned();
                if let Some(colon) = host.find(':') {
                    host.truncate(colon);
                }
                return Some(host);
            }
        }
        i += 1;
    }

    None
}
