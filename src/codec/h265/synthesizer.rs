// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes parameter sets, slice headers and SEI messages as Annex B NAL units, using the same
//! syntax [`Parser`](crate::codec::h265::parser::Parser) reads.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h265::parser::ceil_log2;
use crate::codec::h265::parser::Aps;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::ShortTermRefPicSet;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::sei::ff_coded;
use crate::codec::h265::sei::SeiMessage;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for Aps {}

impl private::NaluStruct for SliceHeader {}

impl private::NaluStruct for [SeiMessage] {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    BitWriter(#[from] BitWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// Layer and temporal id of a synthesized NAL unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluIds {
    pub nuh_layer_id: u8,
    pub temporal_id: u8,
}

/// A helper to output typed NALUs to [`std::io::Write`] using [`BitWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct + ?Sized, W: Write> {
    writer: BitWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct + ?Sized, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value.into())?;
        Ok(())
    }

    fn flag(&mut self, value: bool) -> SynthesizerResult<()> {
        self.writer.write_bit(value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value.into())?;
        Ok(())
    }

    /// Start code and the two byte NAL unit header.
    fn nalu_header(&mut self, nalu_type: NaluType, ids: NaluIds) -> SynthesizerResult<()> {
        if ids.nuh_layer_id > 63 || ids.temporal_id > 6 {
            return Err(SynthesizerError::Unsupported);
        }

        let header = [
            ((nalu_type as u8) << 1) | (ids.nuh_layer_id >> 5),
            ((ids.nuh_layer_id & 0x1f) << 3) | (ids.temporal_id + 1),
        ];

        self.writer.write_raw(&[0x00, 0x00, 0x00, 0x01])?;
        self.writer.write_raw(&header)?;
        Ok(())
    }

    fn st_ref_pic_set(&mut self, set: &ShortTermRefPicSet) -> SynthesizerResult<()> {
        self.ue(set.num_negative_pics() as u32)?;
        self.ue(set.num_positive_pics() as u32)?;

        let mut prev = 0;
        for (&delta, &used) in set.delta_poc_s0.iter().zip(&set.used_by_curr_pic_s0) {
            if delta >= prev {
                return Err(SynthesizerError::Unsupported);
            }
            self.ue((prev - delta - 1) as u32)?;
            self.flag(used)?;
            prev = delta;
        }

        let mut prev = 0;
        for (&delta, &used) in set.delta_poc_s1.iter().zip(&set.used_by_curr_pic_s1) {
            if delta <= prev {
                return Err(SynthesizerError::Unsupported);
            }
            self.ue((delta - prev - 1) as u32)?;
            self.flag(used)?;
            prev = delta;
        }

        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.writer.trailing_bits()?;
        Ok(())
    }

    fn finish(self) -> SynthesizerResult<()> {
        self.writer.finish()?;
        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(sps: &'n Sps, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: BitWriter::new(writer, true),
            nalu: sps,
        };

        s.nalu_header(NaluType::SpsNut, NaluIds::default())?;
        s.seq_parameter_set_data()?;
        s.rbsp_trailing_bits()?;
        s.finish()
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        let sps = self.nalu;

        self.u(4, sps.video_parameter_set_id)?;
        self.u(3, sps.max_sub_layers_minus1)?;
        self.ue(sps.seq_parameter_set_id)?;
        self.ue(sps.chroma_format_idc)?;
        self.ue(sps.pic_width_in_luma_samples)?;
        self.ue(sps.pic_height_in_luma_samples)?;
        self.ue(sps.bit_depth_luma_minus8)?;
        self.ue(sps.bit_depth_chroma_minus8)?;
        self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;
        self.flag(sps.sub_layer_ordering_info_present_flag)?;

        let highest = usize::from(sps.max_sub_layers_minus1);
        let first = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            highest
        };
        for i in first..=highest {
            self.ue(sps.max_dec_pic_buffering_minus1[i])?;
            self.ue(sps.max_num_reorder_pics[i])?;
            self.ue(sps.max_latency_increase_plus1[i])?;
        }

        self.ue(sps.log2_min_luma_coding_block_size_minus3)?;
        self.ue(sps.log2_diff_max_min_luma_coding_block_size)?;
        self.flag(sps.alf_enabled_flag)?;

        self.ue(sps.short_term_ref_pic_sets.len() as u32)?;
        for set in &sps.short_term_ref_pic_sets {
            self.st_ref_pic_set(set)?;
        }

        self.flag(sps.long_term_ref_pics_present_flag)
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(pps: &'n Pps, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: BitWriter::new(writer, true),
            nalu: pps,
        };

        s.nalu_header(NaluType::PpsNut, NaluIds::default())?;
        s.ue(pps.pic_parameter_set_id)?;
        s.ue(pps.seq_parameter_set_id)?;
        s.flag(pps.dependent_slice_segments_enabled_flag)?;
        s.flag(pps.output_flag_present_flag)?;
        s.u(3, pps.num_extra_slice_header_bits)?;
        s.rbsp_trailing_bits()?;
        s.finish()
    }
}

impl<'n, W: Write> Synthesizer<'n, Aps, W> {
    pub fn synthesize(aps: &'n Aps, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: BitWriter::new(writer, true),
            nalu: aps,
        };

        s.nalu_header(NaluType::ApsNut, NaluIds::default())?;
        s.u(5, aps.adaptation_parameter_set_id)?;
        s.u(3, aps.aps_params_type as u8)?;
        s.writer.write_bytes(&s.nalu.data)?;
        s.rbsp_trailing_bits()?;
        s.finish()
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice segment NAL unit with header `hdr` and `slice_data` as payload.
    pub fn synthesize(
        nalu_type: NaluType,
        ids: NaluIds,
        hdr: &'n SliceHeader,
        sps: &Sps,
        pps: &Pps,
        slice_data: &[u8],
        writer: W,
    ) -> SynthesizerResult<()> {
        if !nalu_type.is_slice() {
            return Err(SynthesizerError::Unsupported);
        }

        let mut s = Self {
            writer: BitWriter::new(writer, true),
            nalu: hdr,
        };

        s.nalu_header(nalu_type, ids)?;
        s.slice_segment_header(nalu_type, sps, pps)?;
        // byte_alignment()
        s.rbsp_trailing_bits()?;
        s.writer.write_bytes(slice_data)?;
        s.finish()
    }

    fn slice_segment_header(
        &mut self,
        nalu_type: NaluType,
        sps: &Sps,
        pps: &Pps,
    ) -> SynthesizerResult<()> {
        let hdr = self.nalu;

        self.flag(hdr.first_slice_segment_in_pic_flag)?;
        if nalu_type.is_irap() {
            self.flag(hdr.no_output_of_prior_pics_flag)?;
        }
        self.ue(hdr.pic_parameter_set_id)?;

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                self.flag(hdr.dependent_slice_segment_flag)?;
            }
            self.u(ceil_log2(sps.pic_size_in_ctbs_y()), hdr.segment_address)?;
        }

        if hdr.dependent_slice_segment_flag {
            return Ok(());
        }

        self.u(usize::from(pps.num_extra_slice_header_bits), 0u32)?;
        self.ue(hdr.type_ as u32)?;
        if pps.output_flag_present_flag {
            self.flag(hdr.pic_output_flag)?;
        }

        if !nalu_type.is_idr() {
            let lsb_bits = sps.log2_max_pic_order_cnt_lsb() as usize;
            self.u(lsb_bits, hdr.pic_order_cnt_lsb)?;
            self.flag(hdr.short_term_ref_pic_set_sps_flag)?;

            let num_sets = sps.short_term_ref_pic_sets.len();
            if !hdr.short_term_ref_pic_set_sps_flag {
                self.st_ref_pic_set(&hdr.short_term_ref_pic_set)?;
            } else if num_sets > 1 {
                self.u(
                    ceil_log2(num_sets as u32),
                    hdr.short_term_ref_pic_set_idx,
                )?;
            }

            if sps.long_term_ref_pics_present_flag {
                self.ue(hdr.long_term_refs.len() as u32)?;
                for lt in &hdr.long_term_refs {
                    self.u(lsb_bits, lt.poc_lsb_lt)?;
                    self.flag(lt.used_by_curr_pic_lt_flag)?;
                    self.flag(lt.delta_poc_msb_present_flag)?;
                    if lt.delta_poc_msb_present_flag {
                        self.ue(lt.delta_poc_msb_cycle_lt)?;
                    }
                }
            }
        }

        if sps.alf_enabled_flag {
            self.flag(hdr.alf_enabled_flag)?;
            if hdr.alf_enabled_flag {
                self.u(5, hdr.adaptation_parameter_set_id)?;
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, [SeiMessage], W> {
    /// Writes `messages` as a single SEI NAL unit. `nalu_type` must be one of the SEI types.
    pub fn synthesize(
        nalu_type: NaluType,
        messages: &'n [SeiMessage],
        writer: W,
    ) -> SynthesizerResult<()> {
        if !matches!(nalu_type, NaluType::PrefixSeiNut | NaluType::SuffixSeiNut) {
            return Err(SynthesizerError::Unsupported);
        }

        let mut s = Self {
            writer: BitWriter::new(writer, true),
            nalu: messages,
        };

        s.nalu_header(nalu_type, NaluIds::default())?;
        for message in s.nalu {
            let payload = message.to_payload();
            s.writer.write_bytes(&ff_coded(message.payload_type()))?;
            s.writer.write_bytes(&ff_coded(payload.len() as u32))?;
            s.writer.write_bytes(&payload)?;
        }
        s.rbsp_trailing_bits()?;
        s.finish()
    }
}

/// Writes a NAL unit made of its header only, such as an end of sequence.
pub fn synthesize_empty_nalu<W: Write>(nalu_type: NaluType, writer: W) -> SynthesizerResult<()> {
    let header = [(nalu_type as u8) << 1, 1];
    let mut writer = BitWriter::new(writer, false);
    writer.write_raw(&[0x00, 0x00, 0x00, 0x01])?;
    writer.write_raw(&header)?;
    Ok(())
}
