//! Decoding of downloaded report segments into rows.
//!
//! Segments arrive as a ZIP archive, a gzip stream, or plain delimited
//! text. The first line decides the delimiter: tab when it contains one,
//! comma otherwise.

use flate2::read::GzDecoder;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use thiserror::Error;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = b"\x1f\x8b";

/// A decoded row, keyed by column header.
pub type ReportRow = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("zip archive contains no files")]
    EmptyArchive,

    #[error("decompression: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("delimited text: {0}")]
    Csv(#[from] csv::Error),

    #[error("payload has no header row")]
    MissingHeader,
}

/// Decodes a segment payload into rows.
pub fn decode_segment(payload: &[u8]) -> Result<Vec<ReportRow>, PayloadError> {
    let text = decompress(payload)?;
    parse_delimited(&text)
}

fn decompress(payload: &[u8]) -> Result<String, PayloadError> {
    let bytes = if payload.starts_with(ZIP_MAGIC) {
        let mut archive = zip::ZipArchive::new(Cursor::new(payload))?;
        if archive.len() == 0 {
            return Err(PayloadError::EmptyArchive);
        }
        if archive.len() > 1 {
            warn!("Segment archive holds {} files, reading the first", archive.len());
        }

        let mut entry = archive.by_index(0)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        bytes
    } else if payload.starts_with(GZIP_MAGIC) {
        let mut bytes = Vec::new();
        GzDecoder::new(payload).read_to_end(&mut bytes)?;
        bytes
    } else {
        payload.to_vec()
    };

    debug!("Segment payload is {} bytes uncompressed", bytes.len());

    Ok(String::from_utf8(bytes)?)
}

fn parse_delimited(text: &str) -> Result<Vec<ReportRow>, PayloadError> {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.trim().is_empty() {
        return Err(PayloadError::MissingHeader);
    }
    let delimiter = if first_line.contains('\t') { b'\t' } else { b',' };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_owned())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|value| value.trim().to_owned()))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    const TSV: &str = "Date\tApp Name\tCounts\n2025-10-07\tDemo\t12\n2025-10-08\tDemo\t7\n";

    fn zipped(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn gzipped(content: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_plain_tsv() {
        let rows = decode_segment(TSV.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Date"], "2025-10-07");
        assert_eq!(rows[0]["App Name"], "Demo");
        assert_eq!(rows[1]["Counts"], "7");
    }

    #[test]
    fn test_decode_plain_csv() {
        let rows = decode_segment(b"Date,Counts\n2025-10-07, 3\n").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Counts"], "3");
    }

    #[test]
    fn test_decode_gzip() {
        let rows = decode_segment(&gzipped(TSV)).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_decode_zip_reads_first_entry() {
        let payload = zipped(&[("report.tsv", TSV), ("extra.tsv", "Other\nx\n")]);
        let rows = decode_segment(&payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["Date"], "2025-10-08");
    }

    #[test]
    fn test_decode_header_only() {
        let rows = decode_segment(b"Date\tCounts\n").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(matches!(
            decode_segment(b""),
            Err(PayloadError::MissingHeader)
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(matches!(
            decode_segment(&[0xff, 0xfe, 0x00, 0x41]),
            Err(PayloadError::Utf8(_))
        ));
    }

    #[test]
    fn test_decode_ragged_rows() {
        assert!(matches!(
            decode_segment(b"Date\tCounts\n2025-10-07\t1\textra\n"),
            Err(PayloadError::Csv(_))
        ));
    }

    #[test]
    fn test_decode_corrupt_gzip_header() {
        let payload = [0x1f, 0x8b, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x01];
        assert!(matches!(decode_segment(&payload), Err(PayloadError::Io(_))));
    }
}
