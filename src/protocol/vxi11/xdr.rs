//! External Data Representation (XDR), as defined by RFC4506

use crate::error::{Error, Result};

pub trait XdrPack {
    /// Consume self, appending XDR representation into out
    fn pack_xdr(self, out: &mut Vec<u8>);
}

impl XdrPack for u32 {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        out.extend(self.to_be_bytes());
    }
}

impl XdrPack for i32 {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        out.extend(self.to_be_bytes());
    }
}

impl XdrPack for bool {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self as u32).pack_xdr(out);
    }
}

impl XdrPack for &[u8] {
    /// Variable-length opaque data, length prefixed and zero padded to a
    /// multiple of four bytes
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self.len() as u32).pack_xdr(out);
        out.extend_from_slice(self);
        out.resize(out.len() + padding(self.len()), 0);
    }
}

impl XdrPack for &str {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.as_bytes().pack_xdr(out);
    }
}

fn padding(len: usize) -> usize {
    len.next_multiple_of(4) - len
}

/// Cursor over an XDR encoded buffer
pub struct XdrReader<'a> {
    buf: &'a [u8],
}
impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn u32(&mut self) -> Result<u32> {
        let Some((word, rest)) = self.buf.split_first_chunk::<4>() else {
            return Err(Error::BadResponse(format!(
                "Expected 4 bytes of XDR data, {} left",
                self.buf.len()
            )));
        };
        self.buf = rest;
        Ok(u32::from_be_bytes(*word))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn opaque(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        let padded = len + padding(len);
        if self.buf.len() < padded {
            return Err(Error::BadResponse(format!(
                "Opaque field of {len} bytes, only {} left",
                self.buf.len()
            )));
        }

        let (data, rest) = self.buf.split_at(padded);
        self.buf = rest;
        Ok(&data[..len])
    }

    /// Everything not consumed yet
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_is_padded() {
        let mut out = vec![];
        "inst0".pack_xdr(&mut out);
        assert_eq!(out, b"\0\0\0\x05inst0\0\0\0");

        let mut reader = XdrReader::new(&out);
        assert_eq!(reader.opaque().unwrap(), b"inst0");
        assert!(reader.rest().is_empty());
    }

    #[test]
    fn reads_words_in_order() {
        let mut out = vec![];
        7u32.pack_xdr(&mut out);
        (-2i32).pack_xdr(&mut out);
        true.pack_xdr(&mut out);

        let mut reader = XdrReader::new(&out);
        assert_eq!(reader.u32().unwrap(), 7);
        assert_eq!(reader.i32().unwrap(), -2);
        assert_eq!(reader.u32().unwrap(), 1);
        assert!(matches!(reader.u32(), Err(Error::BadResponse(_))));
    }

    #[test]
    fn short_opaque_is_rejected() {
        let buf = [0, 0, 0, 8, b'a', b'b'];
        assert!(XdrReader::new(&buf).opaque().is_err());
    }
}
