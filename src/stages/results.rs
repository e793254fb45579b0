//! Stage-results binary schema
//!
//! One framed record per document, written to `<output_path>.stages`:
//!
//! ```text
//! [u32 LE frame length]
//! [u64 LE executed mask]
//! for each set bit, in bit order:
//!   [u8 status] [u16 LE payload length] [payload bytes]
//! ```
//!
//! Fields are addressed positionally by bit index; an absent stage is a
//! cleared mask bit, never a missing field among the set bits. Variable-length
//! payload items (keyword lists, TOC entries, subtitle streams) are
//! length-prefixed strings inside the payload. Readers skip payloads they do
//! not understand by the length prefix, so appending stages never breaks old
//! tooling.

use crate::abi::{Stage, StageMask};
use crate::Result;
use std::io::Write;

/// Per-stage execution status, first byte of every present field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageStatus {
    Ok = 0,
    /// Reserved: dependency skips clear the mask bit instead
    SkippedDependency = 1,
    Failed = 2,
    NotAvailable = 3,
}

impl StageStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StageStatus::Ok),
            1 => Some(StageStatus::SkippedDependency),
            2 => Some(StageStatus::Failed),
            3 => Some(StageStatus::NotAvailable),
            _ => None,
        }
    }
}

/// One executed stage's wire field
#[derive(Debug, Clone)]
pub struct StageField {
    pub stage: Stage,
    pub status: StageStatus,
    pub payload: Vec<u8>,
}

/// In-memory form of one document's stage-results record
#[derive(Debug, Clone, Default)]
pub struct StageRecord {
    fields: Vec<StageField>,
}

impl StageRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. Callers push in pipeline (bit) order.
    pub fn push(&mut self, stage: Stage, status: StageStatus, payload: Vec<u8>) {
        self.fields.push(StageField {
            stage,
            status,
            payload,
        });
    }

    /// The executed mask: one bit per present field
    pub fn executed_mask(&self) -> StageMask {
        StageMask(self.fields.iter().fold(0, |m, f| m | f.stage.bit()))
    }

    pub fn field(&self, stage: Stage) -> Option<&StageField> {
        self.fields.iter().find(|f| f.stage == stage)
    }

    pub fn fields(&self) -> &[StageField] {
        &self.fields
    }

    /// Serialize the record body (mask + fields, no frame header)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.fields.len() * 8);
        out.extend_from_slice(&self.executed_mask().0.to_le_bytes());
        for field in &self.fields {
            out.push(field.status as u8);
            debug_assert!(field.payload.len() <= u16::MAX as usize);
            out.extend_from_slice(&(field.payload.len() as u16).to_le_bytes());
            out.extend_from_slice(&field.payload);
        }
        out
    }

    /// Parse a record body produced by [`StageRecord::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        let mask = StageMask(u64::from_le_bytes(bytes[..8].try_into().ok()?));
        let mut at = 8;
        let mut record = StageRecord::new();
        for stage in mask.stages() {
            let status = StageStatus::from_u8(*bytes.get(at)?)?;
            let len =
                u16::from_le_bytes([*bytes.get(at + 1)?, *bytes.get(at + 2)?]) as usize;
            let payload = bytes.get(at + 3..at + 3 + len)?.to_vec();
            record.push(stage, status, payload);
            at += 3 + len;
        }
        Some(record)
    }

    /// Write one framed record
    pub fn write_framed<W: Write>(&self, writer: &mut W) -> Result<()> {
        let body = self.to_bytes();
        writer.write_all(&(body.len() as u32).to_le_bytes())?;
        writer.write_all(&body)?;
        Ok(())
    }

    /// Read one framed record; `None` at clean end of stream
    pub fn read_framed(bytes: &[u8]) -> Option<(Self, usize)> {
        if bytes.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(bytes[..4].try_into().ok()?) as usize;
        let body = bytes.get(4..4 + len)?;
        Some((Self::from_bytes(body)?, 4 + len))
    }
}

// ---------------------------------------------------------------------------
// Payload encoding helpers
//
// Scalars are LE; strings are u8- or u16-length-prefixed UTF-8; lists are a
// u16 count of u16-prefixed strings.
// ---------------------------------------------------------------------------

pub fn put_str8(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

pub fn put_str16(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
}

pub fn put_str_list(out: &mut Vec<u8>, items: &[String]) {
    let count = items.len().min(u16::MAX as usize);
    out.extend_from_slice(&(count as u16).to_le_bytes());
    for item in &items[..count] {
        put_str16(out, item);
    }
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn get_str8(bytes: &[u8], at: &mut usize) -> Option<String> {
    let len = *bytes.get(*at)? as usize;
    let s = bytes.get(*at + 1..*at + 1 + len)?;
    *at += 1 + len;
    Some(String::from_utf8_lossy(s).into_owned())
}

pub fn get_str16(bytes: &[u8], at: &mut usize) -> Option<String> {
    let len = u16::from_le_bytes([*bytes.get(*at)?, *bytes.get(*at + 1)?]) as usize;
    let s = bytes.get(*at + 2..*at + 2 + len)?;
    *at += 2 + len;
    Some(String::from_utf8_lossy(s).into_owned())
}

pub fn get_str_list(bytes: &[u8], at: &mut usize) -> Option<Vec<String>> {
    let count = u16::from_le_bytes([*bytes.get(*at)?, *bytes.get(*at + 1)?]) as usize;
    *at += 2;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(get_str16(bytes, at)?);
    }
    Some(items)
}

pub fn get_f64(bytes: &[u8], at: &mut usize) -> Option<f64> {
    let v = f64::from_le_bytes(bytes.get(*at..*at + 8)?.try_into().ok()?);
    *at += 8;
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip_preserves_positional_fields() {
        let mut record = StageRecord::new();
        let mut lang = Vec::new();
        put_str8(&mut lang, "en");
        put_f64(&mut lang, 0.93);
        record.push(Stage::Language, StageStatus::Ok, lang);
        record.push(Stage::Readability, StageStatus::Failed, Vec::new());
        let mut kw = Vec::new();
        put_str_list(&mut kw, &["alpha".into(), "beta".into()]);
        record.push(Stage::Keywords, StageStatus::Ok, kw);

        let mask = record.executed_mask();
        assert_eq!(mask.0, 0b111);

        let back = StageRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(back.executed_mask(), mask);

        let lang = back.field(Stage::Language).unwrap();
        assert_eq!(lang.status, StageStatus::Ok);
        let mut at = 0;
        assert_eq!(get_str8(&lang.payload, &mut at).unwrap(), "en");
        assert!((get_f64(&lang.payload, &mut at).unwrap() - 0.93).abs() < 1e-12);

        assert_eq!(
            back.field(Stage::Readability).unwrap().status,
            StageStatus::Failed
        );
        let kw = back.field(Stage::Keywords).unwrap();
        let mut at = 0;
        assert_eq!(
            get_str_list(&kw.payload, &mut at).unwrap(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn framed_round_trip() {
        let mut record = StageRecord::new();
        record.push(Stage::Premis, StageStatus::Ok, vec![1, 2, 3]);
        let mut buf = Vec::new();
        record.write_framed(&mut buf).unwrap();
        record.write_framed(&mut buf).unwrap();

        let (first, consumed) = StageRecord::read_framed(&buf).unwrap();
        assert_eq!(first.executed_mask().0, Stage::Premis.bit());
        let (_, consumed2) = StageRecord::read_framed(&buf[consumed..]).unwrap();
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn truncated_record_rejected() {
        let mut record = StageRecord::new();
        record.push(Stage::Language, StageStatus::Ok, vec![0; 32]);
        let bytes = record.to_bytes();
        assert!(StageRecord::from_bytes(&bytes[..bytes.len() - 1]).is_none());
        assert!(StageRecord::from_bytes(&[1, 2]).is_none());
    }

    #[test]
    fn empty_record_is_just_a_mask() {
        let record = StageRecord::new();
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(StageRecord::from_bytes(&bytes).unwrap().fields().len(), 0);
    }
}
