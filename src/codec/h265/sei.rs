// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supplemental enhancement information.
//!
//! Two messages matter to the decoding core: picture timing, which tells whether a
//! picture is a field, and the decoded picture hash, which lets the decoder verify its
//! output. Everything else is kept as opaque payload.

use anyhow::anyhow;
use anyhow::bail;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::codec::h265::parser::Nalu;
use crate::video_frame::VideoFrame;

pub const SEI_PIC_TIMING: u32 = 1;
pub const SEI_DECODED_PICTURE_HASH: u32 = 132;

/// Picture timing, reduced to the frame/field information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureTiming {
    pub pic_struct: u8,
    pub source_scan_type: u8,
    pub duplicate_flag: bool,
}

impl PictureTiming {
    /// Whether `pic_struct` describes a field. Table D.2.
    pub fn is_field(&self) -> bool {
        matches!(self.pic_struct, 1 | 2 | 9 | 10 | 11 | 12)
    }

    pub fn is_top_field(&self) -> bool {
        matches!(self.pic_struct, 1 | 9 | 11)
    }

    fn parse(payload: &[u8]) -> anyhow::Result<Self> {
        let mut r = bitreader::BitReader::new(payload);

        Ok(Self {
            pic_struct: r.read_u8(4)?,
            source_scan_type: r.read_u8(2)?,
            duplicate_flag: r.read_bool()?,
        })
    }

    fn to_payload(self) -> Vec<u8> {
        vec![
            (self.pic_struct << 4)
                | ((self.source_scan_type & 0x3) << 2)
                | (u8::from(self.duplicate_flag) << 1),
        ]
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashType {
    #[default]
    Md5 = 0,
    Crc = 1,
    Checksum = 2,
}

impl HashType {
    fn digest_len(&self) -> usize {
        match self {
            HashType::Md5 => 16,
            HashType::Crc => 2,
            HashType::Checksum => 4,
        }
    }
}

/// Decoded picture hash, one digest per color plane. D.3.19.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedPictureHash {
    pub hash_type: HashType,
    pub digests: Vec<Vec<u8>>,
}

impl DecodedPictureHash {
    /// Computes the hash of `frame` with `hash_type`.
    pub fn compute(hash_type: HashType, frame: &VideoFrame) -> Self {
        let digests = (0..frame.num_planes())
            .map(|plane| match hash_type {
                HashType::Md5 => md5::compute(frame.plane(plane)).0.to_vec(),
                HashType::Crc => plane_crc(frame, plane).to_be_bytes().to_vec(),
                HashType::Checksum => plane_checksum(frame, plane).to_be_bytes().to_vec(),
            })
            .collect();

        Self { hash_type, digests }
    }

    /// Whether `frame` hashes to the digests carried by this message.
    pub fn matches(&self, frame: &VideoFrame) -> bool {
        Self::compute(self.hash_type, frame).digests == self.digests
    }

    fn parse(payload: &[u8]) -> anyhow::Result<Self> {
        let (&hash_type, digests) = payload
            .split_first()
            .ok_or_else(|| anyhow!("empty decoded picture hash"))?;
        let hash_type =
            HashType::n(hash_type).ok_or_else(|| anyhow!("invalid hash_type {}", hash_type))?;

        let len = hash_type.digest_len();
        if digests.is_empty() || digests.len() % len != 0 || digests.len() / len > 3 {
            bail!("decoded picture hash of {} bytes for {:?}", digests.len(), hash_type);
        }

        Ok(Self {
            hash_type,
            digests: digests.chunks(len).map(|d| d.to_vec()).collect(),
        })
    }

    fn to_payload(&self) -> Vec<u8> {
        let mut out = vec![self.hash_type as u8];
        for digest in &self.digests {
            out.extend_from_slice(digest);
        }
        out
    }
}

/// CRC-16 (CCITT polynomial) of a plane, low byte of each sample first.
fn plane_crc(frame: &VideoFrame, plane: usize) -> u16 {
    let geometry = frame.geometry();
    let resolution = geometry.plane_resolution(plane);
    let high_bit_depth = geometry.bit_depth(plane) > 8;

    let mut crc: u32 = 0xffff;
    let mut feed = |byte: u32| {
        for bit_idx in 0..8 {
            let msb = (crc >> 15) & 1;
            let bit = (byte >> (7 - bit_idx)) & 1;
            crc = (((crc << 1) + bit) & 0xffff) ^ (msb * 0x1021);
        }
    };

    for y in 0..resolution.height as usize {
        for x in 0..resolution.width as usize {
            let sample = u32::from(frame.sample(plane, x, y));
            feed(sample & 0xff);
            if high_bit_depth {
                feed(sample >> 8);
            }
        }
    }

    for _ in 0..16 {
        let msb = (crc >> 15) & 1;
        crc = ((crc << 1) & 0xffff) ^ (msb * 0x1021);
    }

    crc as u16
}

fn plane_checksum(frame: &VideoFrame, plane: usize) -> u32 {
    let geometry = frame.geometry();
    let resolution = geometry.plane_resolution(plane);
    let high_bit_depth = geometry.bit_depth(plane) > 8;

    let mut sum: u32 = 0;
    for y in 0..resolution.height {
        for x in 0..resolution.width {
            let mask = (x & 0xff) ^ (y & 0xff) ^ (x >> 8) ^ (y >> 8);
            let sample = u32::from(frame.sample(plane, x as usize, y as usize));
            sum = sum.wrapping_add((sample & 0xff) ^ mask);
            if high_bit_depth {
                sum = sum.wrapping_add((sample >> 8) ^ mask);
            }
        }
    }

    sum
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    PictureTiming(PictureTiming),
    DecodedPictureHash(DecodedPictureHash),
    Other { payload_type: u32, payload: Vec<u8> },
}

impl SeiMessage {
    pub fn payload_type(&self) -> u32 {
        match self {
            SeiMessage::PictureTiming(_) => SEI_PIC_TIMING,
            SeiMessage::DecodedPictureHash(_) => SEI_DECODED_PICTURE_HASH,
            SeiMessage::Other { payload_type, .. } => *payload_type,
        }
    }

    /// The `sei_payload()` bytes of this message.
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            SeiMessage::PictureTiming(timing) => timing.to_payload(),
            SeiMessage::DecodedPictureHash(hash) => hash.to_payload(),
            SeiMessage::Other { payload, .. } => payload.clone(),
        }
    }

    fn parse(payload_type: u32, payload: Vec<u8>) -> anyhow::Result<Self> {
        Ok(match payload_type {
            SEI_PIC_TIMING => SeiMessage::PictureTiming(PictureTiming::parse(&payload)?),
            SEI_DECODED_PICTURE_HASH => {
                SeiMessage::DecodedPictureHash(DecodedPictureHash::parse(&payload)?)
            }
            _ => SeiMessage::Other {
                payload_type,
                payload,
            },
        })
    }
}

/// Reads a value coded as a run of 0xff bytes followed by a final byte.
fn read_ff_coded(r: &mut BitReader) -> anyhow::Result<u32> {
    let mut value = 0u32;
    loop {
        let byte: u32 = r.read_bits(8)?;
        value = value
            .checked_add(byte)
            .ok_or_else(|| anyhow!("SEI field overflow"))?;
        if byte != 0xff {
            return Ok(value);
        }
    }
}

/// Parses every message of a prefix or suffix SEI NAL unit.
pub fn parse_sei(nalu: &Nalu) -> anyhow::Result<Vec<SeiMessage>> {
    let mut r = BitReader::new(nalu.payload());
    let mut messages = vec![];

    loop {
        let payload_type = read_ff_coded(&mut r)?;
        let payload_size = read_ff_coded(&mut r)?;

        let payload = (0..payload_size)
            .map(|_| r.read_bits::<u8>(8))
            .collect::<Result<Vec<_>, _>>()?;

        messages.push(SeiMessage::parse(payload_type, payload)?);

        if !r.has_more_rsbp_data() {
            break;
        }
    }

    Ok(messages)
}

/// Writes `value` in the 0xff run coding of SEI payload types and sizes.
pub(crate) fn ff_coded(mut value: u32) -> Vec<u8> {
    let mut out = vec![];
    while value >= 0xff {
        out.push(0xff);
        value -= 0xff;
    }
    out.push(value as u8);
    out
}

/// Checksum digest as a `u32`, mostly useful for logging.
pub fn checksum_value(digest: &[u8]) -> Option<u32> {
    (digest.len() == 4).then(|| BigEndian::read_u32(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_frame::ChromaFormat;
    use crate::video_frame::Geometry;
    use crate::video_frame::Y_PLANE;
    use crate::Resolution;

    fn frame(bit_depth: u8) -> VideoFrame {
        VideoFrame::new(Geometry {
            resolution: Resolution {
                width: 2,
                height: 2,
            },
            max_cu_size: 16,
            chroma_format: ChromaFormat::Monochrome,
            bit_depth_luma: bit_depth,
            bit_depth_chroma: bit_depth,
        })
    }

    #[test]
    fn checksum_masks_with_coordinates() {
        let mut frame = frame(8);
        frame.fill_plane(Y_PLANE, 0x10);

        // Masks are 0, 1, 1, 0 for (0,0), (1,0), (0,1), (1,1).
        let hash = DecodedPictureHash::compute(HashType::Checksum, &frame);
        let expected = 0x10 + 0x11 + 0x11 + 0x10;
        assert_eq!(checksum_value(&hash.digests[0]), Some(expected));
    }

    #[test]
    fn crc_of_zero_plane() {
        let frame = frame(8);
        let hash = DecodedPictureHash::compute(HashType::Crc, &frame);

        // Feeding 32 zero bits then the 16 bit flush into a 0xffff register.
        let mut crc: u32 = 0xffff;
        for _ in 0..48 {
            let msb = (crc >> 15) & 1;
            crc = ((crc << 1) & 0xffff) ^ (msb * 0x1021);
        }
        assert_eq!(hash.digests[0], (crc as u16).to_be_bytes().to_vec());
    }

    #[test]
    fn hash_detects_modified_samples() {
        let mut frame = frame(10);
        frame.fill_plane(Y_PLANE, 0x200);

        for hash_type in [HashType::Md5, HashType::Crc, HashType::Checksum] {
            let hash = DecodedPictureHash::compute(hash_type, &frame);
            assert!(hash.matches(&frame));

            let mut modified = frame.clone();
            modified.plane_mut(Y_PLANE)[1] = 0x01;
            assert!(!hash.matches(&modified), "{:?}", hash_type);
        }
    }

    #[test]
    fn picture_timing_fields() {
        let top = PictureTiming {
            pic_struct: 9,
            ..Default::default()
        };
        let bottom = PictureTiming {
            pic_struct: 2,
            ..Default::default()
        };
        let frame = PictureTiming::default();

        assert!(top.is_field() && top.is_top_field());
        assert!(bottom.is_field() && !bottom.is_top_field());
        assert!(!frame.is_field());
        assert_eq!(PictureTiming::parse(&top.to_payload()).unwrap(), top);
    }

    #[test]
    fn ff_coding() {
        assert_eq!(ff_coded(132), vec![132]);
        assert_eq!(ff_coded(300), vec![0xff, 45]);
        assert_eq!(ff_coded(0xff), vec![0xff, 0]);
    }
}
