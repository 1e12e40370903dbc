// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! RBSP bit reading and writing, plus an iterator over Annex B streams.

use std::io::Cursor;
use std::io::Write;
use std::marker::PhantomData;

use bytes::Buf;
use thiserror::Error;

use crate::codec::h265::parser::Nalu as H265Nalu;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("invalid exp-golomb code")]
    InvalidExpGolomb,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("value {value} out of bounds {min}..={max}")]
    OutOfBounds { value: i64, min: i64, max: i64 },
}

/// A bit reader for H.265 RBSPs. Emulation prevention bytes are dropped as the stream is
/// read.
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in epb detection.
    prev_two_bytes: u32,
    num_epb: usize,
    num_bits_read: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: 0,
            num_remaining_bits_in_curr_byte: 0,
            prev_two_bytes: 0xffff,
            num_epb: 0,
            num_bits_read: 0,
        }
    }

    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u32;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1u32 << num_bits).wrapping_sub(1);
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.num_bits_read += num_bits;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Number of RBSP bits consumed so far, emulation prevention bytes excluded.
    pub fn num_bits_read(&self) -> usize {
        self.num_bits_read
    }

    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte == 0
    }

    /// Reads `byte_alignment()`: a one bit followed by zero bits up to the next byte
    /// boundary. Also valid for `rbsp_trailing_bits()`.
    pub fn byte_alignment(&mut self) -> Result<(), ReadBitsError> {
        self.read_bit()?;
        let remaining = self.num_remaining_bits_in_curr_byte;
        self.skip_bits(remaining)
    }

    /// Returns the remaining RBSP bytes from a byte aligned position, without the
    /// `rbsp_trailing_bits()`.
    pub fn read_remaining_bytes(&mut self) -> Result<Vec<u8>, ReadBitsError> {
        if !self.is_byte_aligned() {
            return Err(ReadBitsError::ConversionFailed);
        }

        let mut out = vec![];
        while self.update_curr_byte().is_ok() {
            out.push(self.curr_byte as u8);
            self.num_bits_read += 8;
        }
        self.num_remaining_bits_in_curr_byte = 0;

        while out.last() == Some(&0) {
            out.pop();
        }
        if out.last() == Some(&0x80) {
            out.pop();
        }

        Ok(out)
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        self.data.chunk().iter().any(|&b| b != 0)
    }

    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U, ReadBitsError> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        let value = if num_bits == 31 {
            if self.read_bits::<u32>(31)? != 0 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
            u32::MAX >> 1
        } else {
            ((1u32 << num_bits) - 1) + self.read_bits::<u32>(num_bits)?
        };

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(
        &mut self,
        min: u32,
        max: u32,
    ) -> Result<U, ReadBitsError> {
        let value = self.read_ue::<u32>()?;
        if value < min || value > max {
            return Err(ReadBitsError::OutOfBounds {
                value: value.into(),
                min: min.into(),
                max: max.into(),
            });
        }

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> Result<U, ReadBitsError> {
        self.read_ue_bounded(0, max)
    }

    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U, ReadBitsError> {
        let ue = self.read_ue::<u32>()? as i64;
        let value = if ue % 2 == 0 { -ue / 2 } else { ue / 2 + 1 };

        i32::try_from(value)
            .ok()
            .and_then(|v| U::try_from(v).ok())
            .ok_or(ReadBitsError::ConversionFailed)
    }

    fn update_curr_byte(&mut self) -> Result<(), ReadBitsError> {
        if !self.data.has_remaining() {
            return Err(ReadBitsError::OutOfBits);
        }
        let mut byte = self.data.get_u8();

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            self.num_epb += 1;
            if !self.data.has_remaining() {
                return Err(ReadBitsError::OutOfBits);
            }
            byte = self.data.get_u8();
            // We need another 3 bytes before another epb can happen.
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);
        self.curr_byte = u32::from(byte);

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("value {value} does not fit in {bits} bits")]
    ValueTooWide { value: u32, bits: usize },
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBits(usize),
    #[error("operation requires a byte aligned writer")]
    NotAligned,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = Result<T, BitWriterError>;

/// Writes RBSP syntax elements into `W`, inserting emulation prevention bytes when enabled.
pub struct BitWriter<W: Write> {
    out: W,
    curr_byte: u8,
    nth_bit: u8,
    emulation_prevention: bool,
    num_zeros: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(out: W, emulation_prevention: bool) -> Self {
        Self {
            out,
            curr_byte: 0,
            nth_bit: 0,
            emulation_prevention,
            num_zeros: 0,
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.nth_bit == 0
    }

    /// Writes the `bits` least significant bits of `value`.
    pub fn write_f(&mut self, bits: usize, value: u32) -> BitWriterResult<()> {
        if bits > 32 {
            return Err(BitWriterError::TooManyBits(bits));
        }
        if bits < 32 && value >> bits != 0 {
            return Err(BitWriterError::ValueTooWide { value, bits });
        }

        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1)?;
        }

        Ok(())
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= u8::from(bit) << (7 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            let byte = self.curr_byte;
            self.emit(byte)?;
            self.curr_byte = 0;
            self.nth_bit = 0;
        }

        Ok(())
    }

    pub fn write_ue(&mut self, value: u32) -> BitWriterResult<()> {
        let value = u64::from(value) + 1;
        let len = 64 - value.leading_zeros() as usize;

        for _ in 1..len {
            self.write_bit(false)?;
        }
        for i in (0..len).rev() {
            self.write_bit((value >> i) & 1 == 1)?;
        }

        Ok(())
    }

    pub fn write_se(&mut self, value: i32) -> BitWriterResult<()> {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };

        self.write_ue(mapped)
    }

    /// Writes a stop bit and pads with zeros up to the next byte boundary.
    pub fn trailing_bits(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;
        while !self.is_aligned() {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Writes payload bytes at a byte aligned position.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> BitWriterResult<()> {
        if !self.is_aligned() {
            return Err(BitWriterError::NotAligned);
        }

        for &byte in bytes {
            self.emit(byte)?;
        }

        Ok(())
    }

    /// Writes bytes verbatim, bypassing emulation prevention. Used for start codes and NAL
    /// unit headers.
    pub fn write_raw(&mut self, bytes: &[u8]) -> BitWriterResult<()> {
        if !self.is_aligned() {
            return Err(BitWriterError::NotAligned);
        }

        self.out.write_all(bytes)?;
        self.num_zeros = 0;

        Ok(())
    }

    /// Pads the pending byte with zeros and returns the underlying writer.
    pub fn finish(mut self) -> BitWriterResult<W> {
        while !self.is_aligned() {
            self.write_bit(false)?;
        }

        Ok(self.out)
    }

    fn emit(&mut self, byte: u8) -> BitWriterResult<()> {
        if self.emulation_prevention && self.num_zeros >= 2 && byte <= 0x03 {
            self.out.write_all(&[0x03])?;
            self.num_zeros = 0;
        }

        self.out.write_all(&[byte])?;
        if byte == 0 {
            self.num_zeros += 1;
        } else {
            self.num_zeros = 0;
        }

        Ok(())
    }
}

/// Iterates over the NAL units of an Annex B byte stream.
pub struct NalIterator<'a, Nalu>(Cursor<&'a [u8]>, PhantomData<Nalu>);

impl<'a, Nalu> NalIterator<'a, Nalu> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self(Cursor::new(stream), PhantomData)
    }
}

impl<'a> Iterator for NalIterator<'a, H265Nalu<'a>> {
    type Item = H265Nalu<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        H265Nalu::next(&mut self.0).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_stream_with_emulation_prevention() {
        const RBSP: [u8; 6] = [0x00, 0x00, 0x03, 0x01, 0x80, 0x00];

        let mut reader = BitReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(16).unwrap(), 0);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x01);
        assert_eq!(reader.num_epb(), 1);
        assert_eq!(reader.num_bits_read(), 24);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn exp_golomb_values() {
        // 1 | 010 | 011 | 00100 | 00101 -> 0, 1, 2, 3, -2
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut reader = BitReader::new(&data);

        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 3);
        assert_eq!(reader.read_se::<i32>().unwrap(), -2);
    }

    #[test]
    fn out_of_bounds_ue_is_rejected() {
        // ue(v) == 3
        let data = [0b0010_0000];
        let mut reader = BitReader::new(&data);

        assert_eq!(
            reader.read_ue_max::<u8>(2),
            Err(ReadBitsError::OutOfBounds {
                value: 3,
                min: 0,
                max: 2
            })
        );

        // ue(v) == 0
        let data = [0b1000_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(
            reader.read_ue_bounded::<u32>(1, 16888),
            Err(ReadBitsError::OutOfBounds {
                value: 0,
                min: 1,
                max: 16888
            })
        );
    }

    #[test]
    fn writer_inserts_emulation_prevention() {
        let mut writer = BitWriter::new(Vec::new(), true);
        writer.write_bytes(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x00]).unwrap();
        let out = writer.finish().unwrap();

        assert_eq!(out, vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00]);
    }

    #[test]
    fn written_fields_read_back() {
        let mut writer = BitWriter::new(Vec::new(), true);
        writer.write_f(3, 5).unwrap();
        writer.write_ue(300).unwrap();
        writer.write_se(-17).unwrap();
        writer.trailing_bits().unwrap();
        let out = writer.finish().unwrap();

        let mut reader = BitReader::new(&out);
        assert_eq!(reader.read_bits::<u8>(3).unwrap(), 5);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 300);
        assert_eq!(reader.read_se::<i32>().unwrap(), -17);
        reader.byte_alignment().unwrap();
        assert!(reader.is_byte_aligned());
        assert_eq!(reader.num_bits_left(), 0);
    }

    #[test]
    fn value_wider_than_field_is_rejected() {
        let mut writer = BitWriter::new(Vec::new(), false);
        assert!(matches!(
            writer.write_f(2, 4),
            Err(BitWriterError::ValueTooWide { value: 4, bits: 2 })
        ));
    }
}
