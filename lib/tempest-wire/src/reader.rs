// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use crate::{Decimal, Encoding, Error, Result};

/// A position-cursored value reader over an in-memory buffer.
///
/// Re-implements the bits of `std::io::Cursor` we need, narrowing the
/// possible error cases to [`Error`].
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if self.pos + out.len() > self.buf.len() {
            Err(Error::UnexpectedEof)
        } else {
            out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
            self.pos += out.len();
            Ok(())
        }
    }

    /// Reads `count` raw bytes with no length prefix.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.pos + count > self.buf.len() {
            Err(Error::UnexpectedEof)
        } else {
            let slice = &self.buf[self.pos..self.pos + count];
            self.pos += count;
            Ok(slice)
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            self.pos += 1;
            Ok(byte)
        } else {
            Err(Error::UnexpectedEof)
        }
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buffer = [0u8; 2];
        self.read_exact(&mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let mut buffer = [0u8; 2];
        self.read_exact(&mut buffer)?;
        Ok(i16::from_le_bytes(buffer))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buffer = [0u8; 4];
        self.read_exact(&mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buffer = [0u8; 4];
        self.read_exact(&mut buffer)?;
        Ok(i32::from_le_bytes(buffer))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buffer = [0u8; 8];
        self.read_exact(&mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buffer = [0u8; 8];
        self.read_exact(&mut buffer)?;
        Ok(i64::from_le_bytes(buffer))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let mut buffer = [0u8; 4];
        self.read_exact(&mut buffer)?;
        Ok(f32::from_le_bytes(buffer))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut buffer = [0u8; 8];
        self.read_exact(&mut buffer)?;
        Ok(f64::from_le_bytes(buffer))
    }

    pub fn read_decimal(&mut self) -> Result<Decimal> {
        let mut parts = [0i32; 4];
        for part in parts.iter_mut() {
            *part = self.read_i32()?;
        }
        Ok(Decimal::from_parts(parts))
    }

    /// Reads a byte array prefixed with its `i32` length.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::NegativeLength { got: len });
        }
        Ok(self.read_raw(len as usize)?.to_vec())
    }

    /// Reads a 7-bit variable-length integer, the inverse of
    /// [`crate::Writer::write_var_int`].
    pub fn read_var_int(&mut self) -> Result<i32> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(Error::BadVarInt)
    }

    /// Reads an optional length-prefixed string; a `-1` length is `None`.
    pub fn read_str(&mut self, encoding: Encoding) -> Result<Option<String>> {
        let len = self.read_var_int()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(Error::NegativeLength { got: len });
        }

        let bytes = self.read_raw(len as usize)?;
        let text = match encoding {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidText)?,
            Encoding::Ascii => {
                if !bytes.is_ascii() {
                    return Err(Error::InvalidText);
                }
                bytes.iter().map(|&b| b as char).collect()
            }
            Encoding::Utf32 => {
                if bytes.len() % 4 != 0 {
                    return Err(Error::InvalidText);
                }
                bytes
                    .chunks_exact(4)
                    .map(|chunk| {
                        let scalar = u32::from_le_bytes(chunk.try_into().unwrap());
                        char::from_u32(scalar).ok_or(Error::InvalidText)
                    })
                    .collect::<Result<String>>()?
            }
        };
        Ok(Some(text))
    }

    /// Reads a non-null length-prefixed string.
    pub fn read_string(&mut self, encoding: Encoding) -> Result<String> {
        self.read_str(encoding)?.ok_or(Error::InvalidText)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Writer;

    #[test]
    fn primitives_round_trip() {
        let mut writer = Writer::new();
        writer.write_bool(true);
        writer.write_i8(-5);
        writer.write_u16(0xbeef);
        writer.write_i32(i32::MIN);
        writer.write_u64(u64::MAX);
        writer.write_f32(1.5);
        writer.write_f64(-2.25);

        let bytes = writer.into_vec();
        let mut reader = Reader::from_slice(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i8().unwrap(), -5);
        assert_eq!(reader.read_u16().unwrap(), 0xbeef);
        assert_eq!(reader.read_i32().unwrap(), i32::MIN);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_f64().unwrap(), -2.25);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn eof_is_reported() {
        let mut reader = Reader::from_slice(&[1, 2]);
        assert_eq!(reader.read_i32(), Err(Error::UnexpectedEof));
    }

    #[test]
    fn negative_byte_length_is_rejected() {
        let mut writer = Writer::new();
        writer.write_i32(-3);
        let bytes = writer.into_vec();
        let mut reader = Reader::from_slice(&bytes);
        assert_eq!(reader.read_bytes(), Err(Error::NegativeLength { got: -3 }));
    }

    #[test]
    fn var_int_round_trips() {
        for value in [0, 1, 0x7f, 0x80, 300, 0xffff, i32::MAX, -1, i32::MIN] {
            let mut writer = Writer::new();
            writer.write_var_int(value);
            let bytes = writer.into_vec();
            let mut reader = Reader::from_slice(&bytes);
            assert_eq!(reader.read_var_int().unwrap(), value);
        }
    }

    #[test]
    fn strings_round_trip_in_every_encoding() {
        for encoding in [Encoding::Utf8, Encoding::Ascii, Encoding::Utf32] {
            let mut writer = Writer::new();
            writer.write_string("tempest", encoding);
            let bytes = writer.into_vec();
            let mut reader = Reader::from_slice(&bytes);
            assert_eq!(reader.read_string(encoding).unwrap(), "tempest");
        }
    }

    #[test]
    fn utf8_preserves_multibyte_text() {
        let mut writer = Writer::new();
        writer.write_string("héllo ⚡", Encoding::Utf8);
        let bytes = writer.into_vec();
        let mut reader = Reader::from_slice(&bytes);
        assert_eq!(reader.read_string(Encoding::Utf8).unwrap(), "héllo ⚡");
    }

    #[test]
    fn null_string_reads_back_as_none() {
        let mut writer = Writer::new();
        writer.write_str(None, Encoding::Utf8);
        let bytes = writer.into_vec();
        let mut reader = Reader::from_slice(&bytes);
        assert_eq!(reader.read_str(Encoding::Utf8).unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_invalid_text() {
        let mut writer = Writer::new();
        writer.write_var_int(2);
        writer.write_raw(&[0xff, 0xfe]);
        let bytes = writer.into_vec();
        let mut reader = Reader::from_slice(&bytes);
        assert_eq!(reader.read_str(Encoding::Utf8), Err(Error::InvalidText));
    }

    #[test]
    fn decimal_round_trips() {
        let value = Decimal::from_parts([123456789, -1, 42, 0x00030000]);
        let mut writer = Writer::new();
        writer.write_decimal(value);
        let bytes = writer.into_vec();
        let mut reader = Reader::from_slice(&bytes);
        assert_eq!(reader.read_decimal().unwrap(), value);
    }
}
