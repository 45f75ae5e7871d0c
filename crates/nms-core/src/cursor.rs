//! Sequential, bounds-checked reader over an inbound buffer.
//!
//! Every read either consumes exactly the bytes it returns or fails with
//! `OutOfBounds` and leaves the position where it was.

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone)]
pub struct BinaryCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BinaryCursor<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Byte at the current position, `None` at end of buffer.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Everything from the current position to the end.
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(ProtocolError::OutOfBounds {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Skip `n` bytes.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let bytes = self.read_array::<4>()?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Big-endian `u32` at `offset` bytes past the current position, without
    /// consuming anything.
    pub fn peek_u32_be_at(&self, offset: usize) -> Result<u32> {
        let needed = offset.saturating_add(4);
        self.ensure(needed)?;
        let start = self.pos + offset;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[start..start + 4]);
        Ok(u32::from_be_bytes(b))
    }

    /// `len` bytes starting at the current position, without consuming.
    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        Ok(&self.buf[self.pos..self.pos + len])
    }
}
