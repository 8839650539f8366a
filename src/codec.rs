//! Binary codec shared by every wire type
//!
//! Every wire type knows its exact serialized length (`size`), writes exactly
//! that many bytes into a caller-provided buffer (`marshal_to`) and reads itself
//! back from the front of a buffer, reporting how many bytes it consumed
//! (`unmarshal_from`). Fixed-width integers are little-endian; counts and
//! lengths are unsigned LEB128 varints. A decode never panics and never returns
//! a half-built value.

use crate::error::{LedgerError, Result};

/// Longest LEB128 encoding of a `u64`
pub const MAX_UVARINT_LEN: usize = 10;

/// A type with a canonical byte encoding.
pub trait Codec: Sized {
    /// Exact number of bytes `marshal_to` writes.
    fn size(&self) -> usize;

    fn encode(&self, w: &mut Writer<'_>) -> Result<()>;

    fn decode(r: &mut Reader<'_>) -> Result<Self>;

    /// Write the encoding to the front of `buf`, returning the bytes written.
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        self.encode(&mut w)?;
        Ok(w.position())
    }

    /// Decode a value from the front of `buf`, returning it with the number of
    /// bytes consumed.
    fn unmarshal_from(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(buf);
        let value = Self::decode(&mut r)?;
        Ok((value, r.position()))
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.size()];
        let n = self.marshal_to(&mut data)?;
        if n != data.len() {
            return Err(LedgerError::Encode(format!(
                "wrote {} bytes but size() reported {}",
                n,
                data.len()
            )));
        }
        Ok(data)
    }

    /// Decode a value that must occupy all of `buf`.
    fn unmarshal(buf: &[u8]) -> Result<Self> {
        let (value, n) = Self::unmarshal_from(buf)?;
        if n != buf.len() {
            return Err(LedgerError::Decode(format!(
                "{} trailing bytes after value",
                buf.len() - n
            )));
        }
        Ok(value)
    }
}

/// Encoded length of `value` as an unsigned varint
pub fn uvarint_size(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

/// Bounds-checked cursor over an output buffer
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, len: usize, what: &str) -> Result<&mut [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slot = &mut self.buf[self.pos..end];
                self.pos = end;
                Ok(slot)
            }
            None => Err(LedgerError::Encode(format!(
                "buffer too small for {}: need {} bytes at offset {}, have {}",
                what,
                len,
                self.pos,
                self.buf.len()
            ))),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1, "u8")?[0] = value;
        Ok(())
    }

    pub fn put_u16_le(&mut self, value: u16) -> Result<()> {
        self.reserve(2, "u16")?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_u32_le(&mut self, value: u32) -> Result<()> {
        self.reserve(4, "u32")?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_u64_le(&mut self, value: u64) -> Result<()> {
        self.reserve(8, "u64")?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len(), "byte field")?.copy_from_slice(data);
        Ok(())
    }

    pub fn put_uvarint(&mut self, mut value: u64) -> Result<()> {
        let slot = self.reserve(uvarint_size(value), "varint")?;
        let last = slot.len() - 1;
        for (i, byte) in slot.iter_mut().enumerate() {
            *byte = (value & 0x7f) as u8;
            value >>= 7;
            if i != last {
                *byte |= 0x80;
            }
        }
        Ok(())
    }

    /// Write a count, refusing anything a decoder would reject.
    pub fn put_count(&mut self, count: usize, max: usize, what: &str) -> Result<()> {
        if count > max {
            return Err(LedgerError::Encode(format!(
                "too many {}: {} > {}",
                what, count, max
            )));
        }
        self.put_uvarint(count as u64)
    }

    /// Write a length-prefixed field of at most `max` bytes.
    pub fn put_var_bytes(&mut self, data: &[u8], max: usize, what: &str) -> Result<()> {
        if data.len() > max {
            return Err(LedgerError::Encode(format!(
                "{} too long: {} > {} bytes",
                what,
                data.len(),
                max
            )));
        }
        self.put_uvarint(data.len() as u64)?;
        self.put_bytes(data)
    }
}

/// Bounds-checked cursor over an input buffer
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(LedgerError::Decode(format!(
                "truncated {}: need {} bytes at offset {}, have {}",
                what,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn get_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn get_u16_le(&mut self, what: &str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_array(what)?))
    }

    pub fn get_u32_le(&mut self, what: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_array(what)?))
    }

    pub fn get_u64_le(&mut self, what: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_array(what)?))
    }

    pub fn get_uvarint(&mut self, what: &str) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_UVARINT_LEN {
            let byte = self.get_u8(what)?;
            let group = (byte & 0x7f) as u64;
            if i == MAX_UVARINT_LEN - 1 && byte > 1 {
                return Err(LedgerError::Decode(format!("{} overflows u64", what)));
            }
            value |= group << (7 * i);
            if byte & 0x80 == 0 {
                if byte == 0 && i > 0 {
                    return Err(LedgerError::Decode(format!(
                        "non-canonical varint for {}",
                        what
                    )));
                }
                return Ok(value);
            }
        }
        Err(LedgerError::Decode(format!("{} overflows u64", what)))
    }

    /// Read a list count of at most `max` entries.
    pub fn get_count(&mut self, max: usize, what: &str) -> Result<usize> {
        let count = self.get_uvarint(what)?;
        if count > max as u64 {
            return Err(LedgerError::Decode(format!(
                "too many {}: {} > {}",
                what, count, max
            )));
        }
        Ok(count as usize)
    }

    /// Read a length-prefixed field of at most `max` bytes.
    pub fn get_var_bytes(&mut self, max: usize, what: &str) -> Result<Vec<u8>> {
        let len = self.get_uvarint(what)?;
        if len > max as u64 {
            return Err(LedgerError::Decode(format!(
                "{} too long: {} > {} bytes",
                what, len, max
            )));
        }
        Ok(self.take(len as usize, what)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_uvarint(value: u64) -> Vec<u8> {
        let mut buf = vec![0u8; uvarint_size(value)];
        Writer::new(&mut buf).put_uvarint(value).unwrap();
        buf
    }

    #[test]
    fn test_uvarint_size_boundaries() {
        assert_eq!(uvarint_size(0), 1);
        assert_eq!(uvarint_size(127), 1);
        assert_eq!(uvarint_size(128), 2);
        assert_eq!(uvarint_size(16383), 2);
        assert_eq!(uvarint_size(16384), 3);
        assert_eq!(uvarint_size(u64::MAX), MAX_UVARINT_LEN);
    }

    #[test]
    fn test_uvarint_known_encodings() {
        assert_eq!(encode_uvarint(0), vec![0x00]);
        assert_eq!(encode_uvarint(1), vec![0x01]);
        assert_eq!(encode_uvarint(300), vec![0xac, 0x02]);
        assert_eq!(encode_uvarint(520), vec![0x88, 0x04]);
    }

    #[test]
    fn test_uvarint_decode() {
        for value in [0u64, 1, 127, 128, 300, 65535, 1 << 35, u64::MAX] {
            let buf = encode_uvarint(value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.get_uvarint("value").unwrap(), value);
            assert_eq!(reader.position(), buf.len());
        }
    }

    #[test]
    fn test_uvarint_rejects_non_canonical() {
        let mut reader = Reader::new(&[0x80, 0x00]);
        assert!(reader.get_uvarint("value").is_err());
    }

    #[test]
    fn test_uvarint_rejects_truncated() {
        let mut reader = Reader::new(&[0x80]);
        assert!(reader.get_uvarint("value").is_err());
    }

    #[test]
    fn test_uvarint_rejects_overflow() {
        let buf = [0xff; 11];
        let mut reader = Reader::new(&buf);
        assert!(reader.get_uvarint("value").is_err());
    }

    #[test]
    fn test_writer_rejects_short_buffer() {
        let mut buf = [0u8; 3];
        let mut writer = Writer::new(&mut buf);
        assert!(writer.put_u32_le(7).is_err());
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn test_var_bytes_limits() {
        let field = vec![0xab; 9];
        let mut buf = vec![0u8; 16];
        let mut writer = Writer::new(&mut buf);
        assert!(writer.put_var_bytes(&field, 8, "field").is_err());
        writer.put_var_bytes(&field, 9, "field").unwrap();

        let mut reader = Reader::new(&buf);
        assert!(reader.get_var_bytes(8, "field").is_err());
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.get_var_bytes(9, "field").unwrap(), field);
    }

    #[test]
    fn test_count_limit() {
        let buf = encode_uvarint(513);
        let mut reader = Reader::new(&buf);
        assert!(reader.get_count(512, "inputs").is_err());
        let buf = encode_uvarint(512);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.get_count(512, "inputs").unwrap(), 512);
    }
}
