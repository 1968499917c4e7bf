//! Minimal little-endian codec for wire message bodies.
//!
//! Readers are fallible and never panic on short input; writers are
//! infallible and append to a growable buffer.

use std::cell::Cell;
use std::str::Utf8Error;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer has no room to decode any more elements")]
    BufferLength,
    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("invalid tag {tag} for {kind}")]
    InvalidTag { tag: u8, kind: &'static str },
}

/// A source of bytes to decode from. Implemented for `&[u8]`, which
/// advances through the slice as elements are read.
pub trait BufReader<'de> {
    /// Read and return `size` bytes, advancing past them.
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError>;

    /// Bytes left in the buffer.
    fn remaining(&self) -> usize;

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.get_slice(N)?;
        let mut buf = [0; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.get_array::<1>()?[0])
    }

    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        self.get_array().map(u16::from_le_bytes)
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.get_array().map(u32::from_le_bytes)
    }

    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.get_array().map(u64::from_le_bytes)
    }

    /// Read a u32-length-prefixed UTF-8 string.
    fn get_str(&mut self) -> Result<&'de str, DecodeError> {
        let len = self.get_u32()? as usize;
        let bytes = self.get_slice(len)?;
        Ok(std::str::from_utf8(bytes)?)
    }
}

impl<'de> BufReader<'de> for &'de [u8] {
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError> {
        if self.len() < size {
            return Err(DecodeError::BufferLength);
        }
        let (ret, rest) = self.split_at(size);
        *self = rest;
        Ok(ret)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

/// A sink for encoded bytes. Implemented for `Vec<u8>`.
pub trait BufWriter {
    fn put_slice(&mut self, slice: &[u8]);

    fn put_u8(&mut self, val: u8) {
        self.put_slice(&[val]);
    }

    fn put_u16(&mut self, val: u16) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_u32(&mut self, val: u32) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_u64(&mut self, val: u64) {
        self.put_slice(&val.to_le_bytes());
    }

    /// Write a u32-length-prefixed UTF-8 string.
    fn put_str(&mut self, val: &str) {
        self.put_u32(val.len() as u32);
        self.put_slice(val.as_bytes());
    }
}

impl BufWriter for Vec<u8> {
    fn put_slice(&mut self, slice: &[u8]) {
        self.extend_from_slice(slice);
    }
}

/// A read cursor over an owned buffer, usable where the data and the
/// reader must live in one value. `&Cursor` implements [`BufReader`].
pub struct Cursor<I> {
    pub buf: I,
    pub pos: Cell<usize>,
}

impl<I: AsRef<[u8]>> Cursor<I> {
    pub fn new(buf: I) -> Self {
        Self { buf, pos: 0.into() }
    }
}

impl<'de, I: AsRef<[u8]>> BufReader<'de> for &'de Cursor<I> {
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError> {
        let data = &self.buf.as_ref()[self.pos.get()..];
        if data.len() < size {
            return Err(DecodeError::BufferLength);
        }
        self.pos.set(self.pos.get() + size);
        Ok(&data[..size])
    }

    fn remaining(&self) -> usize {
        self.buf.as_ref().len() - self.pos.get()
    }
}
