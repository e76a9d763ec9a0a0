use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{error::SmallError, types::SmallResult};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self;
}

pub fn read_into<T: Decodeable, R: std::io::Read>(reader: &mut R) -> T {
    T::decode_from(reader)
}

pub fn read_exact<R: std::io::Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .expect(&format!("io error, expect {}", bytes_count));
    buffer
}

pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    pub fn new() -> Self {
        let buf = Vec::new();
        Self { buf }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();

        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }

        buf.resize(size, 0);
        buf
    }
}

// All on-disk integers are little-endian.

impl Encodeable for u8 {
    fn encode(&self) -> Vec<u8> {
        vec![*self]
    }
}

impl Decodeable for u8 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        read_exact(reader, 1)[0]
    }
}

impl Encodeable for u16 {
    fn encode(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Decodeable for u16 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        u16::from_le_bytes(read_exact(reader, 2).try_into().unwrap())
    }
}

impl Encodeable for u32 {
    fn encode(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Decodeable for u32 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        u32::from_le_bytes(read_exact(reader, 4).try_into().unwrap())
    }
}

impl Encodeable for u64 {
    fn encode(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Decodeable for u64 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        u64::from_le_bytes(read_exact(reader, 8).try_into().unwrap())
    }
}

impl Encodeable for i32 {
    fn encode(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Decodeable for i32 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        i32::from_le_bytes(read_exact(reader, 4).try_into().unwrap())
    }
}

impl Encodeable for i64 {
    fn encode(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Decodeable for i64 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        i64::from_le_bytes(read_exact(reader, 8).try_into().unwrap())
    }
}

impl Encodeable for f64 {
    fn encode(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Decodeable for f64 {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        f64::from_le_bytes(read_exact(reader, 8).try_into().unwrap())
    }
}

impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        read_exact(reader, 1)[0] != 0
    }
}

/// # Format
///
/// - 2 bytes: utf-8 length (little-endian)
/// - n bytes: utf-8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let payload = self.as_bytes();
        let len = payload.len() as u16;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

impl Decodeable for String {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let len = u16::decode_from(reader);
        let payload = read_exact(reader, len as usize);
        String::from_utf8(payload).expect("invalid utf-8")
    }
}

/// # Format
///
/// - 4 bytes: length (little-endian)
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = self.len() as u32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(self);
        buf
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let len = u32::decode_from(reader);
        read_exact(reader, len as usize)
    }
}

/// Size of the user-space write buffer in front of the WAL file. One
/// fsync per commit, no per-record write-through.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Append-oriented file wrapper used by the log manager.
///
/// Appends accumulate in a user-space buffer and reach the OS on
/// `flush`, the disk on `flush_to_durable`.
pub struct SmallFile {
    file: File,
    buf: Vec<u8>,

    /// Size of the durable prefix plus the buffered tail, i.e. the
    /// offset the next append lands on.
    append_offset: u64,
}

impl SmallFile {
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, SmallError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)?;
        let append_offset = file.metadata()?.len();

        Ok(Self {
            file,
            buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            append_offset,
        })
    }

    pub fn append(&mut self, bytes: &[u8]) -> SmallResult {
        if self.buf.len() + bytes.len() > WRITE_BUFFER_SIZE {
            self.flush_buffer()?;
        }
        if bytes.len() > WRITE_BUFFER_SIZE {
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(bytes)?;
        } else {
            self.buf.extend_from_slice(bytes);
        }
        self.append_offset += bytes.len() as u64;
        Ok(())
    }

    pub fn flush_buffer(&mut self) -> SmallResult {
        if !self.buf.is_empty() {
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Push buffered appends to the OS and fsync. This is the single
    /// synchronous disk barrier of a commit.
    pub fn flush_to_durable(&mut self) -> SmallResult {
        self.flush_buffer()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, dest: &mut [u8]) -> Result<usize, SmallError> {
        self.flush_buffer()?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < dest.len() {
            let n = self.file.read(&mut dest[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub fn size(&self) -> u64 {
        self.append_offset
    }

    pub fn set_len(&mut self, len: u64) -> SmallResult {
        self.flush_buffer()?;
        self.file.set_len(len)?;
        self.append_offset = len;
        Ok(())
    }

    pub fn sync_all(&mut self) -> SmallResult {
        self.flush_buffer()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut writer = SmallWriter::new();
        writer.write(&42u16);
        writer.write(&7u32);
        writer.write(&u64::MAX);
        writer.write(&(-3i64));
        writer.write(&true);
        writer.write(&"hello".to_string());

        let bytes = writer.to_bytes();
        let mut reader = std::io::Cursor::new(bytes);
        assert_eq!(u16::decode_from(&mut reader), 42);
        assert_eq!(u32::decode_from(&mut reader), 7);
        assert_eq!(u64::decode_from(&mut reader), u64::MAX);
        assert_eq!(i64::decode_from(&mut reader), -3);
        assert_eq!(bool::decode_from(&mut reader), true);
        assert_eq!(String::decode_from(&mut reader), "hello");
    }

    #[test]
    fn test_small_file_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.bin");

        let mut file = SmallFile::open(&path).unwrap();
        file.append(b"abcdef").unwrap();
        file.append(b"ghij").unwrap();
        assert_eq!(file.size(), 10);

        let mut buf = [0u8; 10];
        let n = file.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"abcdefghij");
    }
}
