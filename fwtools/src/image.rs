// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sparse in-memory model of an Intel HEX firmware image.
//!
//! An image is an address-keyed byte map. Parsing resolves extended
//! segment/linear address records into absolute addresses; serializing
//! re-chunks the map into ascending-address records with fresh base
//! records and checksums, so the record layout of the input is not
//! preserved, only its byte coverage.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Longest data payload emitted per record when serializing.
const MAX_RECORD_DATA: usize = 16;

/// Intel HEX record types (the `tt` field of a `:llaaaatt...cc` line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            0x03 => Some(Self::StartSegmentAddress),
            0x04 => Some(Self::ExtendedLinearAddress),
            0x05 => Some(Self::StartLinearAddress),
            _ => None,
        }
    }
}

/// Program entry point carried by a type 03 or 05 record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAddress {
    Segment { cs: u16, ip: u16 },
    Linear(u32),
}

/// A firmware image as a sparse mapping from absolute address to byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    bytes: BTreeMap<u32, u8>,
    start_address: Option<StartAddress>,
    /// Optional exclusive upper limit for `write_region`.
    bound: Option<u32>,
}

fn malformed(line: usize, reason: impl Into<String>) -> Error {
    Error::MalformedRecord {
        line,
        reason: reason.into(),
    }
}

impl HexImage {
    /// Decodes one Intel-HEX-formatted byte stream.
    ///
    /// The extended segment/linear base is tracked across records, so
    /// images larger than 64 KiB resolve to their absolute addresses.
    /// Anything after the end-of-file record is ignored.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let mut image = HexImage::default();
        let mut base: u32 = 0;
        let mut line_no = 0;
        let mut seen_eof = false;

        for raw_line in input.split(|&b| b == b'\n') {
            line_no += 1;
            let line = trim_ascii(raw_line);
            if line.is_empty() {
                continue;
            }
            if line[0] != b':' {
                return Err(malformed(line_no, "missing ':' record mark"));
            }
            let record = hex::decode(&line[1..])
                .map_err(|_| malformed(line_no, "invalid hex digits"))?;
            if record.len() < 5 {
                return Err(malformed(line_no, "record truncated"));
            }
            let count = record[0] as usize;
            if record.len() != count + 5 {
                return Err(malformed(
                    line_no,
                    format!(
                        "length field says {count} data bytes, line has {}",
                        record.len() - 5
                    ),
                ));
            }
            let sum = record.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            if sum != 0 {
                return Err(malformed(line_no, "checksum mismatch"));
            }
            let offset = u16::from_be_bytes([record[1], record[2]]) as u32;
            let rtype = RecordType::from_u8(record[3]).ok_or_else(|| {
                malformed(
                    line_no,
                    format!("unknown record type {:#04x}", record[3]),
                )
            })?;
            let data = &record[4..4 + count];

            match rtype {
                RecordType::Data => {
                    for (i, &b) in data.iter().enumerate() {
                        let addr = base
                            .checked_add(offset)
                            .and_then(|a| a.checked_add(i as u32))
                            .ok_or_else(|| {
                                malformed(line_no, "address overflow")
                            })?;
                        image.bytes.insert(addr, b);
                    }
                }
                RecordType::EndOfFile => {
                    if count != 0 {
                        return Err(malformed(
                            line_no,
                            "end-of-file record carries data",
                        ));
                    }
                    seen_eof = true;
                    break;
                }
                RecordType::ExtendedSegmentAddress => {
                    if count != 2 {
                        return Err(malformed(
                            line_no,
                            "extended segment address record must be 2 bytes",
                        ));
                    }
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
                }
                RecordType::ExtendedLinearAddress => {
                    if count != 2 {
                        return Err(malformed(
                            line_no,
                            "extended linear address record must be 2 bytes",
                        ));
                    }
                    base =
                        (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
                }
                RecordType::StartSegmentAddress => {
                    if count != 4 {
                        return Err(malformed(
                            line_no,
                            "start segment address record must be 4 bytes",
                        ));
                    }
                    image.start_address = Some(StartAddress::Segment {
                        cs: u16::from_be_bytes([data[0], data[1]]),
                        ip: u16::from_be_bytes([data[2], data[3]]),
                    });
                }
                RecordType::StartLinearAddress => {
                    if count != 4 {
                        return Err(malformed(
                            line_no,
                            "start linear address record must be 4 bytes",
                        ));
                    }
                    image.start_address = Some(StartAddress::Linear(
                        u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                    ));
                }
            }
        }

        if !seen_eof {
            return Err(malformed(line_no, "missing end-of-file record"));
        }
        Ok(image)
    }

    /// Folds `images` left to right into one image.
    ///
    /// Later images replace data of earlier ones, if they overlap; the
    /// same goes for the start-address record.
    pub fn merge<I>(images: I) -> HexImage
    where
        I: IntoIterator<Item = HexImage>,
    {
        let mut merged = HexImage::default();
        for image in images {
            merged.bytes.extend(image.bytes);
            if image.start_address.is_some() {
                merged.start_address = image.start_address;
            }
        }
        merged
    }

    /// Patches `data` in at `addr`, extending coverage as needed.
    pub fn write_region(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let end = addr.checked_add(data.len() as u32).ok_or(
            Error::OutOfRange {
                addr,
                len: data.len(),
                end: u32::MAX,
            },
        )?;
        if let Some(bound) = self.bound {
            if end > bound {
                return Err(Error::OutOfRange {
                    addr,
                    len: data.len(),
                    end: bound,
                });
            }
        }
        for (i, &b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u32, b);
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `start`; addresses the image does
    /// not cover read as `fill`.
    pub fn read_region_padded(&self, start: u32, len: usize, fill: u8) -> Vec<u8> {
        let mut out = vec![fill; len];
        let end = start.saturating_add(len as u32);
        for (&addr, &b) in self.bytes.range(start..end) {
            out[(addr - start) as usize] = b;
        }
        out
    }

    /// Extends coverage from the current extent up to `end` (exclusive)
    /// with `fill` bytes. Addresses already present are left alone.
    pub fn pad_to(&mut self, end: u32, fill: u8) {
        let from = match self.end_exclusive() {
            Some(e) => e,
            None => return,
        };
        for addr in from..end {
            self.bytes.entry(addr).or_insert(fill);
        }
    }

    /// Declares an exclusive upper address limit for later
    /// `write_region` calls. `None` (the default) is unbounded.
    pub fn set_bound(&mut self, bound: Option<u32>) {
        self.bound = bound;
    }

    pub fn get(&self, addr: u32) -> Option<u8> {
        self.bytes.get(&addr).copied()
    }

    /// Lowest covered address.
    pub fn start(&self) -> Option<u32> {
        self.bytes.keys().next().copied()
    }

    /// One past the highest covered address.
    pub fn end_exclusive(&self) -> Option<u32> {
        self.bytes.keys().next_back().map(|&a| a.saturating_add(1))
    }

    /// Number of covered addresses (not the span).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn start_address(&self) -> Option<StartAddress> {
        self.start_address
    }

    /// Maximal contiguous (start, bytes) runs in ascending order.
    pub fn segments(&self) -> Vec<(u32, Vec<u8>)> {
        let mut out: Vec<(u32, Vec<u8>)> = Vec::new();
        for (&addr, &b) in &self.bytes {
            match out.last_mut() {
                Some((start, data))
                    if *start + data.len() as u32 == addr =>
                {
                    data.push(b);
                }
                _ => out.push((addr, vec![b])),
            }
        }
        out
    }

    /// Re-encodes the image as Intel HEX text.
    ///
    /// Records are emitted in ascending address order, at most
    /// [`MAX_RECORD_DATA`] data bytes each, never straddling a 64 KiB
    /// boundary; a type 04 record precedes any change of the upper
    /// address bits. Output ends with the start-address record (when
    /// one was parsed) and a single end-of-file record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        let mut upper: u32 = 0;
        let mut iter = self.bytes.iter().peekable();

        while let Some((&addr, &first)) = iter.next() {
            let mut chunk = vec![first];
            let mut last = addr;
            while chunk.len() < MAX_RECORD_DATA {
                match iter.peek() {
                    Some(&(&next, &b))
                        if next == last + 1 && (next >> 16) == (addr >> 16) =>
                    {
                        chunk.push(b);
                        last = next;
                        iter.next();
                    }
                    _ => break,
                }
            }
            if (addr >> 16) != upper {
                upper = addr >> 16;
                emit_record(
                    &mut out,
                    0,
                    RecordType::ExtendedLinearAddress,
                    &(upper as u16).to_be_bytes(),
                );
            }
            emit_record(&mut out, (addr & 0xFFFF) as u16, RecordType::Data, &chunk);
        }

        match self.start_address {
            Some(StartAddress::Segment { cs, ip }) => {
                let mut data = [0u8; 4];
                data[..2].copy_from_slice(&cs.to_be_bytes());
                data[2..].copy_from_slice(&ip.to_be_bytes());
                emit_record(&mut out, 0, RecordType::StartSegmentAddress, &data);
            }
            Some(StartAddress::Linear(entry)) => {
                emit_record(
                    &mut out,
                    0,
                    RecordType::StartLinearAddress,
                    &entry.to_be_bytes(),
                );
            }
            None => {}
        }

        emit_record(&mut out, 0, RecordType::EndOfFile, &[]);
        out.into_bytes()
    }
}

fn emit_record(out: &mut String, offset: u16, rtype: RecordType, data: &[u8]) {
    let mut record = Vec::with_capacity(data.len() + 5);
    record.push(data.len() as u8);
    record.extend_from_slice(&offset.to_be_bytes());
    record.push(rtype as u8);
    record.extend_from_slice(data);
    let sum = record.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    record.push(sum.wrapping_neg());
    out.push(':');
    out.push_str(&hex::encode_upper(&record));
    out.push('\n');
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_RECORDS: &str =
        ":10010000214601360121470136007EFE09D2190140\n:00000001FF\n";

    fn image_with(addr: u32, data: &[u8]) -> HexImage {
        let mut image = HexImage::default();
        image.write_region(addr, data).unwrap();
        image
    }

    #[test]
    fn parse_two_record_file() {
        let image = HexImage::parse(TWO_RECORDS.as_bytes()).unwrap();
        assert_eq!(image.len(), 16);
        assert_eq!(image.start(), Some(0x0100));
        assert_eq!(image.get(0x0100), Some(0x21));
        assert_eq!(image.get(0x010F), Some(0x01));
    }

    #[test]
    fn serialize_reproduces_two_record_file() {
        let image = HexImage::parse(TWO_RECORDS.as_bytes()).unwrap();
        let text = String::from_utf8(image.serialize()).unwrap();
        assert_eq!(text, TWO_RECORDS);
    }

    #[test]
    fn round_trip_preserves_byte_map() {
        let mut image = image_with(0x0800_0000, &[0xDE, 0xAD, 0xBE, 0xEF]);
        image.write_region(0x0800_0100, &[1, 2, 3]).unwrap();
        let reparsed = HexImage::parse(&image.serialize()).unwrap();
        assert_eq!(reparsed, image);
    }

    #[test]
    fn round_trip_is_chunking_independent() {
        // 40 contiguous bytes come back as 16+16+8 records but the same
        // address coverage.
        let data: Vec<u8> = (0..40).collect();
        let image = image_with(0x20, &data);
        let text = String::from_utf8(image.serialize()).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(HexImage::parse(text.as_bytes()).unwrap(), image);
    }

    #[test]
    fn checksum_mismatch_reports_line() {
        let input = ":10010000214601360121470136007EFE09D2190141\n";
        match HexImage::parse(input.as_bytes()) {
            Err(Error::MalformedRecord { line, reason }) => {
                assert_eq!(line, 1);
                assert!(reason.contains("checksum"));
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn bad_record_on_second_line_reports_line_two() {
        let input = ":0100000041BE\n:xx\n";
        match HexImage::parse(input.as_bytes()) {
            Err(Error::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn truncated_record_rejected() {
        assert!(matches!(
            HexImage::parse(b":0200"),
            Err(Error::MalformedRecord { .. })
        ));
    }

    #[test]
    fn length_field_mismatch_rejected() {
        // Length field claims 4 data bytes, line carries 1.
        match HexImage::parse(b":0400000041BB\n:00000001FF\n") {
            Err(Error::MalformedRecord { line, reason }) => {
                assert_eq!(line, 1);
                assert!(reason.contains("length"));
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn unknown_record_type_rejected() {
        match HexImage::parse(b":00000006FA\n") {
            Err(Error::MalformedRecord { reason, .. }) => {
                assert!(reason.contains("unknown record type"));
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn missing_eof_rejected() {
        match HexImage::parse(b":0100000041BE\n") {
            Err(Error::MalformedRecord { reason, .. }) => {
                assert!(reason.contains("end-of-file"));
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn extended_linear_address_resolves_absolute() {
        let input = ":020000040800F2\n:0100000041BE\n:00000001FF\n";
        let image = HexImage::parse(input.as_bytes()).unwrap();
        assert_eq!(image.get(0x0800_0000), Some(0x41));
    }

    #[test]
    fn extended_segment_address_resolves_absolute() {
        // usba 0x1000 shifts the segment base to 0x10000.
        let input = ":020000021000EC\n:0100000041BE\n:00000001FF\n";
        let image = HexImage::parse(input.as_bytes()).unwrap();
        assert_eq!(image.get(0x0001_0000), Some(0x41));
    }

    #[test]
    fn serialize_emits_base_record_across_64k() {
        let mut image = image_with(0xFFFF, &[0x01, 0x02]);
        image.write_region(0x2_0000, &[0x03]).unwrap();
        let text = String::from_utf8(image.serialize()).unwrap();
        // One record per byte run plus two type 04 base switches and EOF.
        assert!(text.contains(":020000040001F9"));
        assert!(text.contains(":020000040002F8"));
        assert_eq!(HexImage::parse(text.as_bytes()).unwrap(), image);
    }

    #[test]
    fn start_linear_address_round_trips() {
        let input = ":0400000508000041AE\n:0100000041BE\n:00000001FF\n";
        let image = HexImage::parse(input.as_bytes()).unwrap();
        assert_eq!(
            image.start_address(),
            Some(StartAddress::Linear(0x0800_0041))
        );
        let reparsed = HexImage::parse(&image.serialize()).unwrap();
        assert_eq!(reparsed.start_address(), image.start_address());
    }

    #[test]
    fn merge_later_image_wins_overlap() {
        let a = image_with(0x00, &[0xFF; 16]);
        let b = image_with(0x08, &[0xAA; 8]);
        let merged = HexImage::merge([a, b]);
        for addr in 0x00..0x08 {
            assert_eq!(merged.get(addr), Some(0xFF));
        }
        for addr in 0x08..0x10 {
            assert_eq!(merged.get(addr), Some(0xAA));
        }
    }

    #[test]
    fn merge_fold_equals_pairwise() {
        let a = image_with(0x00, &[1; 8]);
        let b = image_with(0x04, &[2; 8]);
        let c = image_with(0x06, &[3; 8]);
        let all = HexImage::merge([a.clone(), b.clone(), c.clone()]);
        let pairwise = HexImage::merge([HexImage::merge([a, b]), c]);
        assert_eq!(all, pairwise);
    }

    #[test]
    fn write_region_respects_bound() {
        let mut image = HexImage::default();
        image.set_bound(Some(0x10));
        assert!(image.write_region(0x0C, &[0; 4]).is_ok());
        match image.write_region(0x0E, &[0; 4]) {
            Err(Error::OutOfRange { addr, len, end }) => {
                assert_eq!((addr, len, end), (0x0E, 4, 0x10));
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn read_region_padded_fills_gaps() {
        let mut image = image_with(0x10, &[0x11]);
        image.write_region(0x13, &[0x44]).unwrap();
        assert_eq!(
            image.read_region_padded(0x10, 5, 0xFF),
            vec![0x11, 0xFF, 0xFF, 0x44, 0xFF]
        );
    }

    #[test]
    fn pad_to_extends_tail_only() {
        let mut image = image_with(0x10, &[0x11, 0x22]);
        image.pad_to(0x16, 0xFF);
        assert_eq!(image.get(0x11), Some(0x22));
        assert_eq!(image.get(0x12), Some(0xFF));
        assert_eq!(image.get(0x15), Some(0xFF));
        assert_eq!(image.get(0x16), None);
        assert_eq!(image.get(0x0F), None);
    }

    #[test]
    fn segments_reports_contiguous_runs() {
        let mut image = image_with(0x00, &[1, 2]);
        image.write_region(0x10, &[3]).unwrap();
        assert_eq!(
            image.segments(),
            vec![(0x00, vec![1, 2]), (0x10, vec![3])]
        );
    }
}
