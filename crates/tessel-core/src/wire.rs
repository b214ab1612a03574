//! Bounds-checked little-endian reader shared by the message and packet codecs.

use crate::identity::IdString;
use crate::CodecError;

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self {
            buf,
            what,
            offset: 0,
        }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.offset + n;
        if end > self.buf.len() {
            return Err(CodecError::TooShort {
                what: self.what,
                needed: end,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32_le(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64_le(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn identity(&mut self) -> Result<IdString, CodecError> {
        IdString::from_wire(self.array()?)
    }

    /// Everything not consumed yet.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.offset..];
        self.offset = self.buf.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = Reader::new(&data, "test");
        assert_eq!(reader.u8().unwrap(), 0x01);
        assert_eq!(reader.u16_le().unwrap(), 0x0302);
        assert_eq!(reader.u32_le().unwrap(), 0x0706_0504);
        assert!(reader.rest().is_empty());
    }

    #[test]
    fn short_read_reports_sizes() {
        let data = [0u8; 3];
        let mut reader = Reader::new(&data, "sample");
        assert_eq!(
            reader.u64_le(),
            Err(CodecError::TooShort {
                what: "sample",
                needed: 8,
                actual: 3
            })
        );
    }
}
