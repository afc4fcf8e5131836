//! Decoding of raw ring buffer records.
//!
//! Each record is a fixed 16-byte `{entity_key: u32, pad: u32, elapsed_ns: u64}`
//! in native little-endian layout. A buffer may hold several records back to
//! back; [`parse_records`] walks them without allocating.

use thiserror::Error;

use super::event::{LatencyRecord, RECORD_SIZE};

/// Errors that can occur while decoding a record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("record too short: {size} bytes")]
    Truncated { size: usize },

    #[error("trailing {size} bytes after last record")]
    TrailingBytes { size: usize },
}

/// Decodes one record from the start of `data`.
///
/// Extra bytes after the first record are ignored.
pub fn parse_record(data: &[u8]) -> Result<LatencyRecord, ParseError> {
    let Some(raw) = data.get(..RECORD_SIZE) else {
        return Err(ParseError::Truncated { size: data.len() });
    };

    Ok(LatencyRecord {
        entity_key: read_u32_le(raw, 0),
        elapsed_ns: read_u64_le(raw, 8),
    })
}

/// Iterates over consecutive records; yields an error for a partial tail.
pub fn parse_records(data: &[u8]) -> impl Iterator<Item = Result<LatencyRecord, ParseError>> + '_ {
    let chunks = data.chunks_exact(RECORD_SIZE);
    let tail = chunks.remainder().len();
    chunks
        .map(parse_record)
        .chain((tail > 0).then_some(Err(ParseError::TrailingBytes { size: tail })))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: u32, elapsed_ns: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_SIZE);
        buf.extend_from_slice(&key.to_le_bytes());
        buf.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        buf.extend_from_slice(&elapsed_ns.to_le_bytes());
        buf
    }

    #[test]
    fn test_parse_record() {
        let data = record((259 << 20) | 1, 123_456);
        let rec = parse_record(&data).expect("parse");
        assert_eq!(rec.entity_key, (259 << 20) | 1);
        assert_eq!(rec.elapsed_ns, 123_456);
    }

    #[test]
    fn test_padding_is_ignored() {
        let mut data = record(7, 9);
        data[4..8].copy_from_slice(&[0xff; 4]);
        assert_eq!(
            parse_record(&data),
            Ok(LatencyRecord {
                entity_key: 7,
                elapsed_ns: 9
            })
        );
    }

    #[test]
    fn test_truncated_record() {
        let data = record(1, 2);
        let err = parse_record(&data[..10]).expect_err("truncated");
        assert_eq!(err, ParseError::Truncated { size: 10 });
        assert_eq!(err.to_string(), "record too short: 10 bytes");

        assert_eq!(
            parse_record(&[]),
            Err(ParseError::Truncated { size: 0 })
        );
    }

    #[test]
    fn test_parse_many_records() {
        let mut data = record(1, 1_000);
        data.extend(record(2, 2_000));
        data.extend(record(3, 3_000));

        let recs: Vec<LatencyRecord> = parse_records(&data)
            .collect::<Result<_, _>>()
            .expect("parse all");
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[2].entity_key, 3);
        assert_eq!(recs[2].elapsed_ns, 3_000);
    }

    #[test]
    fn test_parse_many_reports_tail() {
        let mut data = record(1, 1_000);
        data.extend_from_slice(&[0u8; 5]);

        let results: Vec<_> = parse_records(&data).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(ParseError::TrailingBytes { size: 5 }));
    }
}
