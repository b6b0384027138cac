//! Byte-slice cursors used by all the frame codecs.
//!
//! DECnet is a little-endian protocol family; the cursors carry LE
//! integer accessors plus the DECnet "image" field convention (one
//! length byte followed by that many bytes).

use super::Error;

pub struct BytesIn<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BytesIn<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn byte(&mut self) -> Result<u8, Error> {
        self.arr::<1>().map(|arr| arr[0])
    }

    pub fn u16_le(&mut self) -> Result<u16, Error> {
        self.arr::<2>().map(u16::from_le_bytes)
    }

    pub fn u32_le(&mut self) -> Result<u32, Error> {
        self.arr::<4>().map(u32::from_le_bytes)
    }

    /// Extensible field: 7 bits per byte, high bit means continue.
    /// Bounded to `max` bytes.
    pub fn ex_le(&mut self, max: usize) -> Result<u16, Error> {
        let mut value = 0u16;
        for shift in 0..max {
            let b = self.byte()?;
            value |= ((b & 0x7f) as u16) << (shift * 7);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::FormatError)
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len() - self.offset {
            Err(Error::MissingData)
        } else {
            let data = &self.data[self.offset..self.offset + len];
            self.offset += len;

            Ok(data)
        }
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.slice(N)?;

        let mut data = [0; N];
        data.copy_from_slice(slice);

        Ok(data)
    }

    /// Image field: a length byte followed by that many bytes, with a
    /// format-level maximum.
    pub fn image(&mut self, max: usize) -> Result<&'a [u8], Error> {
        let len = self.byte()? as usize;
        if len > max {
            return Err(Error::FormatError);
        }
        self.slice(len)
    }

    /// Image field constrained to ASCII, as used for node and system
    /// names.
    pub fn image_str(&mut self, max: usize) -> Result<&'a str, Error> {
        let data = self.image(max)?;
        if !data.is_ascii() {
            return Err(Error::FormatError);
        }
        // ASCII is valid UTF-8
        core::str::from_utf8(data).map_err(|_| Error::FormatError)
    }

    pub fn remaining(&mut self) -> &'a [u8] {
        let len = self.data.len() - self.offset;
        let data = &self.data[self.offset..];
        self.offset += len;

        data
    }
}

pub struct BytesOut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> BytesOut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn byte(&mut self, data: u8) -> Result<&mut Self, Error> {
        self.push(&[data])
    }

    pub fn u16_le(&mut self, data: u16) -> Result<&mut Self, Error> {
        self.push(&data.to_le_bytes())
    }

    pub fn u32_le(&mut self, data: u32) -> Result<&mut Self, Error> {
        self.push(&data.to_le_bytes())
    }

    pub fn zeroes(&mut self, len: usize) -> Result<&mut Self, Error> {
        for _ in 0..len {
            self.byte(0)?;
        }

        Ok(self)
    }

    pub fn image(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > u8::MAX as usize {
            return Err(Error::FormatError);
        }
        self.byte(data.len() as u8)?.push(data)
    }

    pub fn push(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > self.buf.len() - self.offset {
            Err(Error::BufferOverflow)
        } else {
            self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
            self.offset += data.len();

            Ok(self)
        }
    }

    /// Patch a previously written little-endian word, used by the
    /// routing update builder for segment counts.
    pub fn patch_u16_le(&mut self, offset: usize, data: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&data.to_le_bytes());
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    pub fn finish(self) -> &'a [u8] {
        &self.buf[..self.offset]
    }
}
