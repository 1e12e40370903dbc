// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Debug;
use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Context;

pub trait Header: Sized {
    /// Parse the NALU header from the first bytes of `data`.
    fn parse(data: &[u8]) -> anyhow::Result<Self>;
    /// The length of the header in bytes.
    fn len(&self) -> usize;
}

/// A NAL unit borrowed from the buffer that contains it.
#[derive(Clone, Debug)]
pub struct Nalu<'a, U> {
    pub header: U,
    /// The mapping that backs this NALU. Possibly shared with the other NALUs
    /// of the stream.
    pub data: &'a [u8],
    pub size: usize,
    pub offset: usize,
    pub sc_offset: usize,
}

impl<'a, U> Nalu<'a, U>
where
    U: Debug + Header,
{
    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> anyhow::Result<Nalu<'a, U>> {
        let bitstream = *cursor.get_ref();
        let pos = usize::try_from(cursor.position())?;

        let current_nalu_offset =
            Self::find_start_code(bitstream, pos).ok_or_else(|| anyhow!("No NAL found"))?;

        let mut start_code_offset = pos + current_nalu_offset;

        // A preceding zero byte makes this a four byte start code.
        if start_code_offset > 0 && bitstream[start_code_offset - 1] == 0 {
            start_code_offset -= 1;
        }

        let nalu_offset = pos + current_nalu_offset + 3;
        let header = U::parse(&bitstream[nalu_offset..])
            .with_context(|| format!("invalid NAL unit header at offset {}", nalu_offset))?;

        let payload_offset = nalu_offset + header.len();
        let mut size = match Self::find_start_code(bitstream, payload_offset) {
            Some(offset) => header.len() + offset,
            None => bitstream.len() - nalu_offset,
        };

        // Discard trailing_zero_8bits.
        while size > header.len() && bitstream[nalu_offset + size - 1] == 0 {
            size -= 1;
        }

        cursor.set_position(u64::try_from(nalu_offset + size)?);

        Ok(Nalu {
            header,
            data: bitstream,
            size,
            offset: nalu_offset,
            sc_offset: start_code_offset,
        })
    }

    /// Wraps a NAL unit that has already been extracted from its byte stream, i.e. `data`
    /// starts with the NAL unit header.
    pub fn from_unit(data: &'a [u8]) -> anyhow::Result<Nalu<'a, U>> {
        let header = U::parse(data)?;

        Ok(Nalu {
            header,
            data,
            size: data.len(),
            offset: 0,
            sc_offset: 0,
        })
    }

    pub fn header(&self) -> &U {
        &self.header
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn sc_offset(&self) -> usize {
        self.sc_offset
    }

    /// The RBSP bytes following the header, emulation prevention bytes included.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.offset + self.header.len()..self.offset + self.size]
    }
}

impl<'a, U> AsRef<[u8]> for Nalu<'a, U> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::codec::h265::parser::Nalu;
    use crate::codec::h265::parser::NaluType;

    #[test]
    fn start_codes_and_trailing_zeros() {
        const STREAM: [u8; 18] = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xaa, 0x00, 0x00, 0x00, 0x00, 0x01, 0x42, 0x01,
            0xbb, 0xcc, 0x00, 0x00,
        ];

        let mut cursor = Cursor::new(&STREAM[..]);

        let vps = Nalu::next(&mut cursor).unwrap();
        assert_eq!(vps.header.nalu_type(), NaluType::VpsNut);
        assert_eq!(vps.sc_offset(), 0);
        assert_eq!(vps.size(), 3);
        assert_eq!(vps.payload(), &[0xaa]);

        let sps = Nalu::next(&mut cursor).unwrap();
        assert_eq!(sps.header.nalu_type(), NaluType::SpsNut);
        assert_eq!(sps.sc_offset(), 8);
        assert_eq!(sps.offset(), 12);
        assert_eq!(sps.payload(), &[0xbb, 0xcc]);

        assert!(Nalu::next(&mut cursor).is_err());
    }

    #[test]
    fn already_extracted_unit() {
        let nalu = Nalu::from_unit(&[0x50, 0x01, 0x05]).unwrap();
        assert_eq!(nalu.header.nalu_type(), NaluType::PrefixSeiNut);
        assert_eq!(nalu.payload(), &[0x05]);

        // forbidden_zero_bit
        assert!(Nalu::from_unit(&[0xd0, 0x01]).is_err());
        // nuh_temporal_id_plus1 of 0
        assert!(Nalu::from_unit(&[0x50, 0x00]).is_err());
    }
}
