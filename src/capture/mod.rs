//! Packet capture module for Sift
//!
//! This module owns the capture file format: the 24-byte global header, the
//! 16-byte per-record header, and the byte-order rules that tie the two
//! together. Reading and writing live in the `reader` and `writer`
//! submodules.

pub mod reader;
pub mod writer;

use thiserror::Error;

/// Capture magic in the capturing host's byte order.
pub const MAGIC_NATIVE: u32 = 0xA1B2_C3D4;
/// Capture magic as seen when the capturing host had the opposite byte
/// order; every multi-byte field must then be swapped on read.
pub const MAGIC_SWAPPED: u32 = 0xD4C3_B2A1;

/// Size of the file-level header.
pub const GLOBAL_HEADER_LEN: usize = 24;
/// Size of each per-record header.
pub const RECORD_HEADER_LEN: usize = 16;
/// Hard upper bound on a single captured frame.
pub const MAX_FRAME_LEN: u32 = 65_535;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid capture magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("truncated global header")]
    TruncatedHeader,

    #[error("record length {got} exceeds limit {limit}")]
    OversizedRecord { got: u32, limit: u32 },

    #[error("truncated record body: expected {expected} bytes, read {read}")]
    TruncatedRecord { expected: usize, read: usize },
}

/// File-level capture header, with fields normalized to host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapGlobalHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub linktype: u32,
}

impl PcapGlobalHeader {
    /// Parse the raw 24 header bytes. Returns the normalized header and
    /// whether subsequent record fields need byte-swapping.
    pub fn parse(bytes: &[u8; GLOBAL_HEADER_LEN]) -> Result<(PcapGlobalHeader, bool), CaptureError> {
        let magic = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

        let swapped: bool = match magic {
            MAGIC_NATIVE => false,
            MAGIC_SWAPPED => true,
            other => return Err(CaptureError::BadMagic(other)),
        };

        let u16_at = |i: usize| {
            let v = u16::from_ne_bytes([bytes[i], bytes[i + 1]]);
            if swapped {
                v.swap_bytes()
            } else {
                v
            }
        };
        let u32_at = |i: usize| {
            let v = u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
            if swapped {
                v.swap_bytes()
            } else {
                v
            }
        };

        let header = PcapGlobalHeader {
            magic: if swapped { magic.swap_bytes() } else { magic },
            version_major: u16_at(4),
            version_minor: u16_at(6),
            thiszone: u32_at(8) as i32,
            sigfigs: u32_at(12),
            snaplen: u32_at(16),
            linktype: u32_at(20),
        };

        Ok((header, swapped))
    }

    /// Serialize the header in host byte order.
    pub fn to_bytes(&self) -> [u8; GLOBAL_HEADER_LEN] {
        let mut bytes = [0u8; GLOBAL_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.version_major.to_ne_bytes());
        bytes[6..8].copy_from_slice(&self.version_minor.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.thiszone.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.sigfigs.to_ne_bytes());
        bytes[16..20].copy_from_slice(&self.snaplen.to_ne_bytes());
        bytes[20..24].copy_from_slice(&self.linktype.to_ne_bytes());
        bytes
    }
}

/// Per-record header, fields normalized to host order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcapRecordHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub incl_len: u32,
    pub orig_len: u32,
}

/// One captured record: its header plus the raw frame bytes.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub header: PcapRecordHeader,
    pub data: Vec<u8>,
}
