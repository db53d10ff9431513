//! Capture file reader for Sift
//!
//! Single-producer reader that exclusively owns the input file handle. The
//! byte order detected from the magic applies to every record header read
//! afterwards.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{debug, info};

use crate::capture::{
    CaptureError, PcapGlobalHeader, PcapRecordHeader, RawRecord, GLOBAL_HEADER_LEN,
    MAX_FRAME_LEN, RECORD_HEADER_LEN,
};

/// Reader over a capture file.
pub struct PcapReader {
    file: BufReader<File>,
    header: PcapGlobalHeader,
    raw_header: [u8; GLOBAL_HEADER_LEN],
    swapped: bool,
    records_read: u64,
}

impl PcapReader {
    /// Open a capture file and validate its global header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<PcapReader, CaptureError> {
        let mut file = BufReader::new(File::open(path.as_ref())?);

        let mut raw_header = [0u8; GLOBAL_HEADER_LEN];
        file.read_exact(&mut raw_header)
            .map_err(|_| CaptureError::TruncatedHeader)?;

        let (header, swapped) = PcapGlobalHeader::parse(&raw_header)?;

        info!(
            "Opened capture: version {}.{}, snaplen {}, linktype {}{}",
            header.version_major,
            header.version_minor,
            header.snaplen,
            header.linktype,
            if swapped { " (byte-swapped)" } else { "" }
        );

        Ok(PcapReader {
            file,
            header,
            raw_header,
            swapped,
            records_read: 0,
        })
    }

    /// Read the next record. `Ok(None)` marks a clean end of stream; a
    /// record that violates the length limits is an error.
    pub fn next_record(&mut self) -> Result<Option<RawRecord>, CaptureError> {
        let mut header_bytes = [0u8; RECORD_HEADER_LEN];

        // Short read on the record header signals end of stream.
        if self.file.read_exact(&mut header_bytes).is_err() {
            debug!("End of capture after {} records", self.records_read);
            return Ok(None);
        }

        let u32_at = |i: usize| {
            let v = u32::from_ne_bytes([
                header_bytes[i],
                header_bytes[i + 1],
                header_bytes[i + 2],
                header_bytes[i + 3],
            ]);
            if self.swapped {
                v.swap_bytes()
            } else {
                v
            }
        };

        let header = PcapRecordHeader {
            ts_sec: u32_at(0),
            ts_usec: u32_at(4),
            incl_len: u32_at(8),
            orig_len: u32_at(12),
        };

        let limit: u32 = u32::min(self.header.snaplen, MAX_FRAME_LEN);
        if header.incl_len > limit {
            return Err(CaptureError::OversizedRecord {
                got: header.incl_len,
                limit,
            });
        }

        let mut data = vec![0u8; header.incl_len as usize];
        let mut read_total: usize = 0;
        while read_total < data.len() {
            let n: usize = self.file.read(&mut data[read_total..])?;
            if n == 0 {
                return Err(CaptureError::TruncatedRecord {
                    expected: data.len(),
                    read: read_total,
                });
            }
            read_total += n;
        }

        self.records_read += 1;
        Ok(Some(RawRecord { header, data }))
    }

    /// The normalized global header.
    pub fn global_header(&self) -> &PcapGlobalHeader {
        &self.header
    }

    /// The global header exactly as it appeared on disk, for verbatim
    /// copying into the output file.
    pub fn raw_global_header(&self) -> &[u8; GLOBAL_HEADER_LEN] {
        &self.raw_header
    }

    /// Whether record fields are byte-swapped relative to this host.
    pub fn needs_byte_swap(&self) -> bool {
        self.swapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MAGIC_NATIVE;
    use std::io::Write;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sift-reader-{}-{}.pcap", tag, std::process::id()))
    }

    fn write_capture(path: &Path, swapped: bool, frames: &[&[u8]]) {
        let mut file = File::create(path).unwrap();

        let swap32 = |v: u32| if swapped { v.swap_bytes() } else { v };
        let swap16 = |v: u16| if swapped { v.swap_bytes() } else { v };

        file.write_all(&swap32(MAGIC_NATIVE).to_ne_bytes()).unwrap();
        file.write_all(&swap16(2).to_ne_bytes()).unwrap();
        file.write_all(&swap16(4).to_ne_bytes()).unwrap();
        file.write_all(&0i32.to_ne_bytes()).unwrap();
        file.write_all(&0u32.to_ne_bytes()).unwrap();
        file.write_all(&swap32(65_535).to_ne_bytes()).unwrap();
        file.write_all(&swap32(1).to_ne_bytes()).unwrap();

        for (i, frame) in frames.iter().enumerate() {
            file.write_all(&swap32(100 + i as u32).to_ne_bytes()).unwrap();
            file.write_all(&swap32(0).to_ne_bytes()).unwrap();
            file.write_all(&swap32(frame.len() as u32).to_ne_bytes()).unwrap();
            file.write_all(&swap32(frame.len() as u32).to_ne_bytes()).unwrap();
            file.write_all(frame).unwrap();
        }
    }

    #[test]
    fn reads_native_order_records() {
        let path = temp_path("native");
        write_capture(&path, false, &[b"abc", b"defgh"]);

        let mut reader = PcapReader::open(&path).unwrap();
        assert!(!reader.needs_byte_swap());
        assert_eq!(reader.global_header().snaplen, 65_535);

        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.header.ts_sec, 100);
        assert_eq!(first.data, b"abc");

        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second.header.incl_len, 5);

        assert!(reader.next_record().unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reads_swapped_order_records() {
        let path = temp_path("swapped");
        write_capture(&path, true, &[b"xyz"]);

        let mut reader = PcapReader::open(&path).unwrap();
        assert!(reader.needs_byte_swap());
        assert_eq!(reader.global_header().snaplen, 65_535);

        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.header.ts_sec, 100);
        assert_eq!(record.header.incl_len, 3);
        assert_eq!(record.data, b"xyz");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn oversized_record_is_rejected() {
        let path = temp_path("oversized");
        let mut file = File::create(&path).unwrap();
        file.write_all(&MAGIC_NATIVE.to_ne_bytes()).unwrap();
        file.write_all(&2u16.to_ne_bytes()).unwrap();
        file.write_all(&4u16.to_ne_bytes()).unwrap();
        file.write_all(&0i32.to_ne_bytes()).unwrap();
        file.write_all(&0u32.to_ne_bytes()).unwrap();
        file.write_all(&1024u32.to_ne_bytes()).unwrap(); // snaplen
        file.write_all(&1u32.to_ne_bytes()).unwrap();
        file.write_all(&0u32.to_ne_bytes()).unwrap();
        file.write_all(&0u32.to_ne_bytes()).unwrap();
        file.write_all(&2048u32.to_ne_bytes()).unwrap(); // incl_len > snaplen
        file.write_all(&2048u32.to_ne_bytes()).unwrap();
        drop(file);

        let mut reader = PcapReader::open(&path).unwrap();
        assert!(matches!(
            reader.next_record(),
            Err(CaptureError::OversizedRecord { got: 2048, limit: 1024 })
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn truncated_global_header_fails_open() {
        let path = temp_path("short");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            PcapReader::open(&path),
            Err(CaptureError::TruncatedHeader)
        ));
        std::fs::remove_file(&path).ok();
    }
}
