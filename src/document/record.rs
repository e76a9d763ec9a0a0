use std::{cmp::Ordering, convert::TryInto, fmt};

use crate::{
    error::{ErrorKind, SmallError},
    io::SmallWriter,
};

/// One field value of a document.
#[derive(Debug, Clone)]
pub enum Cell {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    ObjectId([u8; 12]),
    Guid([u8; 16]),
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_FLOAT64: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_OBJECT_ID: u8 = 7;
const TAG_GUID: u8 = 8;

impl Cell {
    fn numeric(&self) -> Option<f64> {
        match self {
            Cell::Int32(v) => Some(*v as f64),
            Cell::Int64(v) => Some(*v as f64),
            Cell::Float64(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Bool(a), Cell::Bool(b)) => a == b,
            (Cell::String(a), Cell::String(b)) => a == b,
            (Cell::Bytes(a), Cell::Bytes(b)) => a == b,
            (Cell::ObjectId(a), Cell::ObjectId(b)) => a == b,
            (Cell::Guid(a), Cell::Guid(b)) => a == b,
            _ => match (self.numeric(), other.numeric()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Cell::String(a), Cell::String(b)) => a.partial_cmp(b),
            (Cell::Bytes(a), Cell::Bytes(b)) => a.partial_cmp(b),
            (Cell::ObjectId(a), Cell::ObjectId(b)) => a.partial_cmp(b),
            (Cell::Guid(a), Cell::Guid(b)) => a.partial_cmp(b),
            (Cell::Bool(a), Cell::Bool(b)) => a.partial_cmp(b),
            _ => match (self.numeric(), other.numeric()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "null"),
            Cell::Bool(v) => write!(f, "{}", v),
            Cell::Int32(v) => write!(f, "{}", v),
            Cell::Int64(v) => write!(f, "{}", v),
            Cell::Float64(v) => write!(f, "{}", v),
            Cell::String(v) => write!(f, "{:?}", v),
            Cell::Bytes(v) => write!(f, "bytes[{}]", v.len()),
            Cell::ObjectId(v) => write!(f, "oid:{}", hex::encode(v)),
            Cell::Guid(v) => write!(f, "guid:{}", hex::encode(v)),
        }
    }
}

/// A schema-free document: an ordered list of named field values with
/// a self-describing binary form.
///
/// # Format
///
/// - 2 bytes: field count
/// - per field: name (`u16` length + utf-8), tag byte, value bytes
///   (fixed width for scalars, `u32` length prefix for strings and
///   binary)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Cell)>,
}

impl Record {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Set a field, replacing an existing one of the same name.
    pub fn set(mut self, name: &str, cell: Cell) -> Self {
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
            entry.1 = cell;
        } else {
            self.fields.push((name.to_string(), cell));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cell)| cell)
    }

    pub fn fields(&self) -> &[(String, Cell)] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        writer.write(&(self.fields.len() as u16));
        for (name, cell) in &self.fields {
            writer.write(name);
            encode_cell_tagged(&mut writer, cell);
        }
        writer.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Record, SmallError> {
        let mut walker = RawWalker::new(payload)?;
        let mut fields = Vec::with_capacity(walker.remaining());
        while let Some((name, cell)) = walker.next_field()? {
            fields.push((name, cell));
        }
        Ok(Record { fields })
    }
}

fn encode_cell_tagged(writer: &mut SmallWriter, cell: &Cell) {
    match cell {
        Cell::Null => writer.write(&TAG_NULL),
        Cell::Bool(v) => {
            writer.write(&TAG_BOOL);
            writer.write(v);
        }
        Cell::Int32(v) => {
            writer.write(&TAG_INT32);
            writer.write(v);
        }
        Cell::Int64(v) => {
            writer.write(&TAG_INT64);
            writer.write(v);
        }
        Cell::Float64(v) => {
            writer.write(&TAG_FLOAT64);
            writer.write(v);
        }
        Cell::String(v) => {
            writer.write(&TAG_STRING);
            writer.write(&(v.len() as u32));
            writer.write_bytes(v.as_bytes());
        }
        Cell::Bytes(v) => {
            writer.write(&TAG_BYTES);
            writer.write(&(v.len() as u32));
            writer.write_bytes(v);
        }
        Cell::ObjectId(v) => {
            writer.write(&TAG_OBJECT_ID);
            writer.write_bytes(v);
        }
        Cell::Guid(v) => {
            writer.write(&TAG_GUID);
            writer.write_bytes(v);
        }
    }
}

/// Single-pass cursor over an encoded record.
///
/// `find` skips the value bytes of non-matching fields without
/// materializing them, which is what makes predicate push-down on the
/// raw payload cheap.
pub struct RawWalker<'a> {
    payload: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> RawWalker<'a> {
    pub fn new(payload: &'a [u8]) -> Result<Self, SmallError> {
        if payload.len() < 2 {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                "record payload shorter than its header",
            ));
        }
        let count = u16::from_le_bytes(payload[..2].try_into().unwrap()) as usize;
        Ok(Self {
            payload,
            pos: 2,
            remaining: count,
        })
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SmallError> {
        if self.pos + len > self.payload.len() {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                "record payload truncated",
            ));
        }
        let bytes = &self.payload[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u16(&mut self) -> Result<u16, SmallError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, SmallError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn next_name(&mut self) -> Result<Option<&'a [u8]>, SmallError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let len = self.read_u16()? as usize;
        Ok(Some(self.take(len)?))
    }

    fn decode_value(&mut self) -> Result<Cell, SmallError> {
        let tag = self.take(1)?[0];
        let cell = match tag {
            TAG_NULL => Cell::Null,
            TAG_BOOL => Cell::Bool(self.take(1)?[0] != 0),
            TAG_INT32 => Cell::Int32(i32::from_le_bytes(self.take(4)?.try_into().unwrap())),
            TAG_INT64 => Cell::Int64(i64::from_le_bytes(self.take(8)?.try_into().unwrap())),
            TAG_FLOAT64 => Cell::Float64(f64::from_le_bytes(self.take(8)?.try_into().unwrap())),
            TAG_STRING => {
                let len = self.read_u32()? as usize;
                let bytes = self.take(len)?;
                Cell::String(String::from_utf8(bytes.to_vec()).map_err(|_| {
                    SmallError::new(ErrorKind::Corruption, "record field is not utf-8")
                })?)
            }
            TAG_BYTES => {
                let len = self.read_u32()? as usize;
                Cell::Bytes(self.take(len)?.to_vec())
            }
            TAG_OBJECT_ID => Cell::ObjectId(self.take(12)?.try_into().unwrap()),
            TAG_GUID => Cell::Guid(self.take(16)?.try_into().unwrap()),
            _ => {
                return Err(SmallError::new(
                    ErrorKind::Corruption,
                    &format!("unknown record tag {}", tag),
                ))
            }
        };
        Ok(cell)
    }

    fn skip_value(&mut self) -> Result<(), SmallError> {
        let tag = self.take(1)?[0];
        let len = match tag {
            TAG_NULL => 0,
            TAG_BOOL => 1,
            TAG_INT32 => 4,
            TAG_INT64 | TAG_FLOAT64 => 8,
            TAG_OBJECT_ID => 12,
            TAG_GUID => 16,
            TAG_STRING | TAG_BYTES => self.read_u32()? as usize,
            _ => {
                return Err(SmallError::new(
                    ErrorKind::Corruption,
                    &format!("unknown record tag {}", tag),
                ))
            }
        };
        self.take(len)?;
        Ok(())
    }

    pub fn next_field(&mut self) -> Result<Option<(String, Cell)>, SmallError> {
        let name = match self.next_name()? {
            None => return Ok(None),
            Some(name) => String::from_utf8(name.to_vec())
                .map_err(|_| SmallError::new(ErrorKind::Corruption, "field name is not utf-8"))?,
        };
        let cell = self.decode_value()?;
        Ok(Some((name, cell)))
    }

    /// Walk until `field` is found, decoding only its value.
    pub fn find(mut self, field: &str) -> Result<Option<Cell>, SmallError> {
        while let Some(name) = self.next_name()? {
            if name == field.as_bytes() {
                return Ok(Some(self.decode_value()?));
            }
            self.skip_value()?;
        }
        Ok(None)
    }
}

/// Fetch a single field straight off the encoded payload.
pub fn raw_field(payload: &[u8], field: &str) -> Result<Option<Cell>, SmallError> {
    RawWalker::new(payload)?.find(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::new()
            .set("name", Cell::String("ada".to_string()))
            .set("age", Cell::Int64(36))
            .set("score", Cell::Float64(9.75))
            .set("active", Cell::Bool(true))
            .set("blob", Cell::Bytes(vec![1, 2, 3]))
            .set("tag", Cell::Null)
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let record = sample();
        let bytes = record.encode();
        let decoded = Record::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_set_replaces_existing_field() {
        let record = Record::new()
            .set("age", Cell::Int64(1))
            .set("age", Cell::Int64(2));
        assert_eq!(record.field_count(), 1);
        assert_eq!(record.get("age"), Some(&Cell::Int64(2)));
    }

    #[test]
    fn test_raw_field_short_circuits() {
        let bytes = sample().encode();
        assert_eq!(raw_field(&bytes, "age").unwrap(), Some(Cell::Int64(36)));
        assert_eq!(
            raw_field(&bytes, "name").unwrap(),
            Some(Cell::String("ada".to_string()))
        );
        assert_eq!(raw_field(&bytes, "missing").unwrap(), None);
    }

    #[test]
    fn test_numeric_comparison_across_widths() {
        assert_eq!(Cell::Int32(5), Cell::Int64(5));
        assert_eq!(Cell::Int64(5), Cell::Float64(5.0));
        assert!(Cell::Int32(5) < Cell::Int64(6));
        assert!(Cell::Float64(5.5) > Cell::Int64(5));
        assert_ne!(Cell::String("5".to_string()), Cell::Int64(5));
    }

    #[test]
    fn test_truncated_payload_is_corruption() {
        let bytes = sample().encode();
        let err = Record::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }
}
