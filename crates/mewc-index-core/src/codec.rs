//! Binary codec: varints, little-endian integers, length-prefixed byte
//! strings. Shared by the transaction deserializer and the asset blob
//! parser so both drive the same cursor discipline.

use mewc_index_common::DeserializeError;

/// A forward-only cursor over a byte slice, mirroring the `Deserializer`
/// cursor in the original wire-format reader: every read advances `pos` and
/// returns `Truncated` rather than panicking on a short buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Cursor { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    pub fn slice_from(&self, start: usize) -> &'a [u8] {
        &self.buf[start..self.pos]
    }

    fn need(&self, n: usize) -> Result<(), DeserializeError> {
        if self.remaining() < n {
            return Err(DeserializeError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DeserializeError> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DeserializeError> {
        let s = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(s);
        Ok(out)
    }

    pub fn peek(&self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        Some(&self.buf[self.pos..self.pos + n])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DeserializeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DeserializeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DeserializeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DeserializeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DeserializeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Bitcoin-style compact size: `<253` is a literal byte, `0xfd` then a
    /// u16, `0xfe` then a u32, `0xff` then a u64.
    pub fn read_varint(&mut self) -> Result<u64, DeserializeError> {
        let n = self.read_bytes(1)?[0];
        match n {
            0..=252 => Ok(n as u64),
            253 => Ok(self.read_u16_le()? as u64),
            254 => Ok(self.read_u32_le()? as u64),
            255 => self.read_u64_le(),
        }
    }

    pub fn read_varbytes(&mut self) -> Result<&'a [u8], DeserializeError> {
        let len = self.read_varint()?;
        let len =
            usize::try_from(len).map_err(|_| DeserializeError::MalformedVarint)?;
        if len > self.remaining() {
            return Err(DeserializeError::MalformedVarint);
        }
        self.read_bytes(len)
    }
}

pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 253 {
        out.push(n as u8);
    } else if n <= u16::MAX as u64 {
        out.push(253);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= u32::MAX as u64 {
        out.push(254);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(255);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

pub fn write_varbytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip_boundaries() {
        for n in [0u64, 1, 252, 253, 254, 65535, 65536, u32::MAX as u64, u32::MAX as u64 + 1] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut cur = Cursor::new(&buf);
            assert_eq!(cur.read_varint().unwrap(), n);
            assert_eq!(cur.pos(), buf.len());
        }
    }

    #[test]
    fn truncated_read_reports_need() {
        let buf = [0x01u8];
        let mut cur = Cursor::new(&buf);
        let err = cur.read_u32_le().unwrap_err();
        assert_eq!(
            err,
            DeserializeError::Truncated {
                needed: 4,
                remaining: 1
            }
        );
    }

    #[test]
    fn varbytes_rejects_overclaimed_length() {
        // varint says 10 bytes follow, only 2 are present
        let buf = [10u8, 0xAA, 0xBB];
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.read_varbytes().unwrap_err(), DeserializeError::MalformedVarint);
    }
}
