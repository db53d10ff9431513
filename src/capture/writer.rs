//! Capture file writer for Sift
//!
//! Serializes forwarded packets back into the capture format. The global
//! header is the input file's header copied verbatim, so the output magic
//! always equals the input magic; record headers are written in the same
//! byte order the magic declares. A mutex guards the file because record
//! writes race with flushing at shutdown.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::capture::{CaptureError, GLOBAL_HEADER_LEN};

/// Writer producing a capture file compatible with the input's byte order.
pub struct PcapWriter {
    file: Mutex<BufWriter<File>>,
    swapped: bool,
}

impl PcapWriter {
    /// Create the output file and write the verbatim global header.
    pub fn create<P: AsRef<Path>>(
        path: P,
        raw_global_header: &[u8; GLOBAL_HEADER_LEN],
        swapped: bool,
    ) -> Result<PcapWriter, CaptureError> {
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        file.write_all(raw_global_header)?;

        Ok(PcapWriter {
            file: Mutex::new(file),
            swapped,
        })
    }

    /// Append one record: a 16-byte header followed by the frame bytes.
    pub fn write_record(
        &self,
        ts_sec: u32,
        ts_usec: u32,
        frame: &[u8],
    ) -> Result<(), CaptureError> {
        let len = frame.len() as u32;

        let swap = |v: u32| if self.swapped { v.swap_bytes() } else { v };

        let mut file = self.file.lock();
        file.write_all(&swap(ts_sec).to_ne_bytes())?;
        file.write_all(&swap(ts_usec).to_ne_bytes())?;
        file.write_all(&swap(len).to_ne_bytes())?;
        file.write_all(&swap(len).to_ne_bytes())?;
        file.write_all(frame)?;
        Ok(())
    }

    /// Flush buffered records to disk.
    pub fn flush(&self) -> Result<(), CaptureError> {
        self.file.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::reader::PcapReader;
    use crate::capture::{PcapGlobalHeader, MAGIC_NATIVE};

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sift-writer-{}-{}.pcap", tag, std::process::id()))
    }

    #[test]
    fn written_file_reads_back() {
        let header = PcapGlobalHeader {
            magic: MAGIC_NATIVE,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65_535,
            linktype: 1,
        };

        let path = temp_path("roundtrip");
        let writer = PcapWriter::create(&path, &header.to_bytes(), false).unwrap();
        writer.write_record(7, 42, b"frame-bytes").unwrap();
        writer.flush().unwrap();

        let mut reader = PcapReader::open(&path).unwrap();
        assert_eq!(reader.global_header(), &header);

        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.header.ts_sec, 7);
        assert_eq!(record.header.ts_usec, 42);
        assert_eq!(record.header.orig_len, 11);
        assert_eq!(record.data, b"frame-bytes");
        assert!(reader.next_record().unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn swapped_output_stays_self_consistent() {
        let header = PcapGlobalHeader {
            magic: MAGIC_NATIVE,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65_535,
            linktype: 1,
        };

        // Fabricate the on-disk form of a byte-swapped header.
        let mut raw = header.to_bytes();
        raw[0..4].reverse();
        raw[4..6].reverse();
        raw[6..8].reverse();
        raw[8..12].reverse();
        raw[12..16].reverse();
        raw[16..20].reverse();
        raw[20..24].reverse();

        let path = temp_path("swapped");
        let writer = PcapWriter::create(&path, &raw, true).unwrap();
        writer.write_record(1234, 5678, b"pkt").unwrap();
        writer.flush().unwrap();

        // The reader must detect the swap and normalize both headers.
        let mut reader = PcapReader::open(&path).unwrap();
        assert!(reader.needs_byte_swap());
        assert_eq!(reader.global_header().snaplen, 65_535);

        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.header.ts_sec, 1234);
        assert_eq!(record.header.incl_len, 3);
        assert_eq!(record.data, b"pkt");

        std::fs::remove_file(&path).ok();
    }
}
