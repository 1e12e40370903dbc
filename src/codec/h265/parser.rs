// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the H.265 high level syntax consumed by the decoding core.
//!
//! Only the fields that drive picture management are carried: geometry, POC, buffering
//! and reordering bounds, reference picture sets and the parameter set links. Everything
//! the sample pipeline needs beyond that stays in the slice payload.

use std::rc::Rc;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::codec::h265::param_sets::ParameterSetKind;
use crate::codec::h265::param_sets::ParameterSetStore;
use crate::utils::nalu;
use crate::utils::nalu::Header;
use crate::video_frame::ChromaFormat;
use crate::video_frame::Geometry;
use crate::Resolution;

pub const MAX_SUB_LAYERS: usize = 7;
pub const MAX_SPS_COUNT: u8 = 16;
pub const MAX_PPS_COUNT: u8 = 64;
pub const MAX_APS_COUNT: u8 = 32;
pub const MAX_DPB_SIZE: usize = 16;
pub const MAX_SHORT_TERM_REF_PIC_SETS: usize = 64;
pub const MAX_LONG_TERM_REF_PICS: usize = 32;
/// Largest picture width or height, in luma samples. Level 6.2 allows 8444 x 16888.
pub const MAX_PIC_DIMENSION: u32 = 16888;

/// Table 7-1 – NAL unit type codes and NAL unit type classes. Type 35 carries adaptation
/// parameter sets.
#[derive(N, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    ApsNut = 35,
    AudNut = 36,
    EosNut = 37,
    EobNut = 38,
    FdNut = 39,
    PrefixSeiNut = 40,
    SuffixSeiNut = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

/// How the decoder routes a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluClass {
    Slice,
    VideoParameterSet,
    ParameterSet(ParameterSetKind),
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfBitstream,
    FillerData,
    PrefixSei,
    SuffixSei,
    ReservedVcl,
    ReservedNonVcl,
    Unspecified,
}

impl NaluType {
    pub fn class(&self) -> NaluClass {
        match self {
            NaluType::TrailN
            | NaluType::TrailR
            | NaluType::TsaN
            | NaluType::TsaR
            | NaluType::StsaN
            | NaluType::StsaR
            | NaluType::RadlN
            | NaluType::RadlR
            | NaluType::RaslN
            | NaluType::RaslR
            | NaluType::BlaWLp
            | NaluType::BlaWRadl
            | NaluType::BlaNLp
            | NaluType::IdrWRadl
            | NaluType::IdrNLp
            | NaluType::CraNut => NaluClass::Slice,
            NaluType::RsvVclN10
            | NaluType::RsvVclR11
            | NaluType::RsvVclN12
            | NaluType::RsvVclR13
            | NaluType::RsvVclN14
            | NaluType::RsvVclR15
            | NaluType::RsvIrapVcl22
            | NaluType::RsvIrapVcl23
            | NaluType::RsvVcl24
            | NaluType::RsvVcl25
            | NaluType::RsvVcl26
            | NaluType::RsvVcl27
            | NaluType::RsvVcl28
            | NaluType::RsvVcl29
            | NaluType::RsvVcl30
            | NaluType::RsvVcl31 => NaluClass::ReservedVcl,
            NaluType::VpsNut => NaluClass::VideoParameterSet,
            NaluType::SpsNut => NaluClass::ParameterSet(ParameterSetKind::Sps),
            NaluType::PpsNut => NaluClass::ParameterSet(ParameterSetKind::Pps),
            NaluType::ApsNut => NaluClass::ParameterSet(ParameterSetKind::Aps),
            NaluType::AudNut => NaluClass::AccessUnitDelimiter,
            NaluType::EosNut => NaluClass::EndOfSequence,
            NaluType::EobNut => NaluClass::EndOfBitstream,
            NaluType::FdNut => NaluClass::FillerData,
            NaluType::PrefixSeiNut => NaluClass::PrefixSei,
            NaluType::SuffixSeiNut => NaluClass::SuffixSei,
            NaluType::RsvNvcl42
            | NaluType::RsvNvcl43
            | NaluType::RsvNvcl44
            | NaluType::RsvNvcl45
            | NaluType::RsvNvcl46
            | NaluType::RsvNvcl47 => NaluClass::ReservedNonVcl,
            NaluType::Unspec48
            | NaluType::Unspec49
            | NaluType::Unspec50
            | NaluType::Unspec51
            | NaluType::Unspec52
            | NaluType::Unspec53
            | NaluType::Unspec54
            | NaluType::Unspec55
            | NaluType::Unspec56
            | NaluType::Unspec57
            | NaluType::Unspec58
            | NaluType::Unspec59
            | NaluType::Unspec60
            | NaluType::Unspec61
            | NaluType::Unspec62
            | NaluType::Unspec63 => NaluClass::Unspecified,
        }
    }

    pub fn is_slice(&self) -> bool {
        matches!(self.class(), NaluClass::Slice)
    }

    pub fn is_idr(&self) -> bool {
        matches!(self, NaluType::IdrWRadl | NaluType::IdrNLp)
    }

    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= NaluType::BlaWLp as u32 && type_ <= NaluType::RsvIrapVcl23 as u32
    }

    pub fn is_bla(&self) -> bool {
        matches!(
            self,
            NaluType::BlaWLp | NaluType::BlaWRadl | NaluType::BlaNLp
        )
    }

    pub fn is_cra(&self) -> bool {
        matches!(self, NaluType::CraNut)
    }

    pub fn is_radl(&self) -> bool {
        matches!(self, NaluType::RadlN | NaluType::RadlR)
    }

    pub fn is_rasl(&self) -> bool {
        matches!(self, NaluType::RaslN | NaluType::RaslR)
    }

    /// Sub-layer non-reference picture.
    pub fn is_slnr(&self) -> bool {
        matches!(
            self,
            NaluType::TrailN
                | NaluType::TsaN
                | NaluType::StsaN
                | NaluType::RadlN
                | NaluType::RaslN
                | NaluType::RsvVclN10
                | NaluType::RsvVclN12
                | NaluType::RsvVclN14
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    pub nuh_layer_id: u8,
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn nalu_type(&self) -> NaluType {
        self.type_
    }

    pub fn nuh_layer_id(&self) -> u8 {
        self.nuh_layer_id
    }

    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1.saturating_sub(1)
    }
}

impl Header for NaluHeader {
    fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 2 {
            bail!("NAL unit header truncated ({} bytes)", data.len());
        }

        let mut r = bitreader::BitReader::new(&data[..2]);

        if r.read_bool()? {
            bail!("forbidden_zero_bit is set");
        }

        let type_ = r.read_u8(6)?;
        let type_ =
            NaluType::n(type_).ok_or_else(|| anyhow!("invalid NAL unit type {}", type_))?;
        let nuh_layer_id = r.read_u8(6)?;
        let nuh_temporal_id_plus1 = r.read_u8(3)?;

        if nuh_temporal_id_plus1 == 0 {
            bail!("nuh_temporal_id_plus1 must not be zero");
        }

        Ok(NaluHeader {
            type_,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        })
    }

    fn len(&self) -> usize {
        2
    }
}

pub type Nalu<'a> = nalu::Nalu<'a, NaluHeader>;

/// A short-term reference picture set, with the deltas already accumulated. 7.4.8.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    /// Negative POC deltas, closest first.
    pub delta_poc_s0: Vec<i32>,
    pub used_by_curr_pic_s0: Vec<bool>,
    /// Positive POC deltas, closest first.
    pub delta_poc_s1: Vec<i32>,
    pub used_by_curr_pic_s1: Vec<bool>,
}

impl ShortTermRefPicSet {
    /// Builds a set where every entry is used by the current picture.
    pub fn with_deltas(before: &[i32], after: &[i32]) -> Self {
        Self {
            delta_poc_s0: before.to_vec(),
            used_by_curr_pic_s0: vec![true; before.len()],
            delta_poc_s1: after.to_vec(),
            used_by_curr_pic_s1: vec![true; after.len()],
        }
    }

    pub fn num_negative_pics(&self) -> usize {
        self.delta_poc_s0.len()
    }

    pub fn num_positive_pics(&self) -> usize {
        self.delta_poc_s1.len()
    }

    pub fn num_delta_pocs(&self) -> usize {
        self.num_negative_pics() + self.num_positive_pics()
    }

    fn parse(r: &mut BitReader) -> anyhow::Result<Self> {
        let num_negative_pics: usize = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
        let num_positive_pics: usize =
            r.read_ue_max((MAX_DPB_SIZE - 1 - num_negative_pics) as u32)?;

        let mut set = ShortTermRefPicSet::default();

        let mut prev = 0;
        for _ in 0..num_negative_pics {
            let delta_poc_s0_minus1: i32 = r.read_ue_max(32767)?;
            prev -= delta_poc_s0_minus1 + 1;
            set.delta_poc_s0.push(prev);
            set.used_by_curr_pic_s0.push(r.read_bit()?);
        }

        let mut prev = 0;
        for _ in 0..num_positive_pics {
            let delta_poc_s1_minus1: i32 = r.read_ue_max(32767)?;
            prev += delta_poc_s1_minus1 + 1;
            set.delta_poc_s1.push(prev);
            set.used_by_curr_pic_s1.push(r.read_bit()?);
        }

        Ok(set)
    }
}

/// A long-term reference signalled in the slice header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LongTermRefPic {
    pub poc_lsb_lt: u32,
    pub used_by_curr_pic_lt_flag: bool,
    pub delta_poc_msb_present_flag: bool,
    pub delta_poc_msb_cycle_lt: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u8; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u8; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub alf_enabled_flag: bool,
    pub short_term_ref_pic_sets: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
}

impl Sps {
    pub fn chroma_format(&self) -> ChromaFormat {
        ChromaFormat::n(self.chroma_format_idc).unwrap_or_default()
    }

    pub fn bit_depth_luma(&self) -> u8 {
        self.bit_depth_luma_minus8 + 8
    }

    pub fn bit_depth_chroma(&self) -> u8 {
        self.bit_depth_chroma_minus8 + 8
    }

    pub fn log2_max_pic_order_cnt_lsb(&self) -> u32 {
        u32::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb()
    }

    pub fn ctb_log2_size_y(&self) -> u32 {
        u32::from(self.log2_min_luma_coding_block_size_minus3)
            + 3
            + u32::from(self.log2_diff_max_min_luma_coding_block_size)
    }

    pub fn ctb_size_y(&self) -> u32 {
        1 << self.ctb_log2_size_y()
    }

    pub fn pic_width_in_ctbs_y(&self) -> u32 {
        self.pic_width_in_luma_samples.div_ceil(self.ctb_size_y())
    }

    pub fn pic_height_in_ctbs_y(&self) -> u32 {
        self.pic_height_in_luma_samples.div_ceil(self.ctb_size_y())
    }

    pub fn pic_size_in_ctbs_y(&self) -> u32 {
        self.pic_width_in_ctbs_y() * self.pic_height_in_ctbs_y()
    }

    /// The highest temporal sub-layer of the sequence.
    pub fn highest_tid(&self) -> u8 {
        self.max_sub_layers_minus1
    }

    /// DPB capacity for temporal layer `tid`.
    pub fn max_dec_pic_buffering(&self, tid: u8) -> usize {
        let tid = usize::from(tid.min(self.max_sub_layers_minus1));
        usize::from(self.max_dec_pic_buffering_minus1[tid]) + 1
    }

    pub fn max_num_reorder_pics(&self, tid: u8) -> usize {
        let tid = usize::from(tid.min(self.max_sub_layers_minus1));
        usize::from(self.max_num_reorder_pics[tid])
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.pic_width_in_luma_samples,
            height: self.pic_height_in_luma_samples,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            resolution: self.resolution(),
            max_cu_size: self.ctb_size_y(),
            chroma_format: self.chroma_format(),
            bit_depth_luma: self.bit_depth_luma(),
            bit_depth_chroma: self.bit_depth_chroma(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
}

#[derive(N, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ApsParamsType {
    #[default]
    Alf = 0,
    Lmcs = 1,
    ScalingList = 2,
}

/// Adaptation parameter set. The parameters themselves are only meaningful to the sample
/// pipeline and are carried as opaque bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Aps {
    pub adaptation_parameter_set_id: u8,
    pub aps_params_type: ApsParamsType,
    pub data: Vec<u8>,
}

#[derive(N, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    B = 0,
    P = 1,
    I = 2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    pub type_: SliceType,
    pub pic_output_flag: bool,
    pub pic_order_cnt_lsb: u32,
    pub short_term_ref_pic_set_sps_flag: bool,
    pub short_term_ref_pic_set_idx: u8,
    /// The explicitly coded set, if `short_term_ref_pic_set_sps_flag` is not set.
    pub short_term_ref_pic_set: ShortTermRefPicSet,
    pub long_term_refs: Vec<LongTermRefPic>,
    pub alf_enabled_flag: bool,
    pub adaptation_parameter_set_id: u8,
    /// Size of the header in bits, emulation prevention bytes excluded.
    pub header_bit_size: u32,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            first_slice_segment_in_pic_flag: false,
            no_output_of_prior_pics_flag: false,
            pic_parameter_set_id: 0,
            dependent_slice_segment_flag: false,
            segment_address: 0,
            type_: SliceType::I,
            pic_output_flag: true,
            pic_order_cnt_lsb: 0,
            short_term_ref_pic_set_sps_flag: false,
            short_term_ref_pic_set_idx: 0,
            short_term_ref_pic_set: Default::default(),
            long_term_refs: Default::default(),
            alf_enabled_flag: false,
            adaptation_parameter_set_id: 0,
            header_bit_size: 0,
        }
    }
}

impl SliceHeader {
    /// The short-term reference picture set in use by this slice.
    pub fn curr_rps<'a>(&'a self, sps: &'a Sps) -> &'a ShortTermRefPicSet {
        if self.short_term_ref_pic_set_sps_flag {
            sps.short_term_ref_pic_sets
                .get(usize::from(self.short_term_ref_pic_set_idx))
                .unwrap_or(&self.short_term_ref_pic_set)
        } else {
            &self.short_term_ref_pic_set
        }
    }
}

/// A slice segment header along with the NAL unit that carries it.
#[derive(Clone, Debug)]
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
}

/// Number of bits needed to code values in `0..n`.
pub(crate) fn ceil_log2(n: u32) -> usize {
    if n <= 1 {
        0
    } else {
        (32 - (n - 1).leading_zeros()) as usize
    }
}

/// Parses high level syntax and keeps the resulting parameter sets.
#[derive(Debug, Default)]
pub struct Parser {
    sets: ParameterSetStore,
}

impl Parser {
    pub fn parameter_sets(&self) -> &ParameterSetStore {
        &self.sets
    }

    pub fn parameter_sets_mut(&mut self) -> &mut ParameterSetStore {
        &mut self.sets
    }

    fn reader<'a>(nalu: &Nalu<'a>) -> BitReader<'a> {
        BitReader::new(nalu.payload())
    }

    /// Parses an SPS and stores it.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<Rc<Sps>> {
        let mut r = Self::reader(nalu);
        let mut sps = Sps {
            video_parameter_set_id: r.read_bits(4)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            seq_parameter_set_id: r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?,
            chroma_format_idc: r.read_ue_max(3)?,
            pic_width_in_luma_samples: r.read_ue_bounded(1, MAX_PIC_DIMENSION)?,
            pic_height_in_luma_samples: r.read_ue_bounded(1, MAX_PIC_DIMENSION)?,
            bit_depth_luma_minus8: r.read_ue_max(8)?,
            bit_depth_chroma_minus8: r.read_ue_max(8)?,
            log2_max_pic_order_cnt_lsb_minus4: r.read_ue_max(12)?,
            sub_layer_ordering_info_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if usize::from(sps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            bail!("invalid sps_max_sub_layers_minus1 {}", sps.max_sub_layers_minus1);
        }

        let highest = usize::from(sps.max_sub_layers_minus1);
        let first = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            highest
        };

        for i in first..=highest {
            sps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_SIZE as u32 - 1)?;
            sps.max_num_reorder_pics[i] =
                r.read_ue_max(u32::from(sps.max_dec_pic_buffering_minus1[i]))?;
            sps.max_latency_increase_plus1[i] = r.read_ue()?;
        }

        // Lower sub-layers inherit the values of the highest one when not signalled.
        for i in 0..first {
            sps.max_dec_pic_buffering_minus1[i] = sps.max_dec_pic_buffering_minus1[highest];
            sps.max_num_reorder_pics[i] = sps.max_num_reorder_pics[highest];
            sps.max_latency_increase_plus1[i] = sps.max_latency_increase_plus1[highest];
        }

        sps.log2_min_luma_coding_block_size_minus3 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue_max(3)?;
        sps.alf_enabled_flag = r.read_bit()?;

        let num_short_term_ref_pic_sets: usize =
            r.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS as u32)?;
        for i in 0..num_short_term_ref_pic_sets {
            let set = ShortTermRefPicSet::parse(&mut r)
                .with_context(|| format!("invalid st_ref_pic_set({})", i))?;
            sps.short_term_ref_pic_sets.push(set);
        }

        sps.long_term_ref_pics_present_flag = r.read_bit()?;

        log::debug!(
            "SPS {}: {}x{}, ctb {}, dpb {:?}, reorder {:?}",
            sps.seq_parameter_set_id,
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples,
            sps.ctb_size_y(),
            &sps.max_dec_pic_buffering_minus1[..=highest],
            &sps.max_num_reorder_pics[..=highest]
        );

        let id = sps.seq_parameter_set_id;
        Ok(self.sets.sps.store(id, sps))
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<Rc<Pps>> {
        let mut r = Self::reader(nalu);
        let pps = Pps {
            pic_parameter_set_id: r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?,
            seq_parameter_set_id: r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?,
            dependent_slice_segments_enabled_flag: r.read_bit()?,
            output_flag_present_flag: r.read_bit()?,
            num_extra_slice_header_bits: r.read_bits(3)?,
        };

        log::debug!(
            "PPS {} referring to SPS {}",
            pps.pic_parameter_set_id,
            pps.seq_parameter_set_id
        );

        let id = pps.pic_parameter_set_id;
        Ok(self.sets.pps.store(id, pps))
    }

    pub fn parse_aps(&mut self, nalu: &Nalu) -> anyhow::Result<Rc<Aps>> {
        let mut r = Self::reader(nalu);
        let adaptation_parameter_set_id = r.read_bits(5)?;
        let params_type: u8 = r.read_bits(3)?;
        let aps_params_type = ApsParamsType::n(params_type)
            .ok_or_else(|| anyhow!("invalid aps_params_type {}", params_type))?;

        let aps = Aps {
            adaptation_parameter_set_id,
            aps_params_type,
            data: r.read_remaining_bytes()?,
        };

        log::debug!(
            "APS {} ({:?}, {} bytes)",
            aps.adaptation_parameter_set_id,
            aps.aps_params_type,
            aps.data.len()
        );

        Ok(self.sets.aps.store(adaptation_parameter_set_id, aps))
    }

    /// Parses a slice segment header. Dependent slice segments take the fields they do
    /// not carry from `last_independent`, the header of the preceding independent slice
    /// segment.
    pub fn parse_slice_header<'a>(
        &self,
        nalu: Nalu<'a>,
        last_independent: Option<&SliceHeader>,
    ) -> anyhow::Result<Slice<'a>> {
        let nalu_type = nalu.header.type_;
        if !nalu_type.is_slice() {
            bail!("{:?} does not carry a slice", nalu_type);
        }

        let mut r = Self::reader(&nalu);
        let first_slice_segment_in_pic_flag = r.read_bit()?;
        let no_output_of_prior_pics_flag = if nalu_type.is_irap() {
            r.read_bit()?
        } else {
            false
        };
        let pic_parameter_set_id: u8 = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;

        let pps = self.sets.pps.get(pic_parameter_set_id)?;
        let sps = self.sets.sps.get(pps.seq_parameter_set_id)?;

        let mut dependent_slice_segment_flag = false;
        let mut segment_address = 0;
        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = r.read_bit()?;
            }
            segment_address = r.read_bits(ceil_log2(sps.pic_size_in_ctbs_y()))?;
            if segment_address >= sps.pic_size_in_ctbs_y() {
                bail!("slice_segment_address {} out of range", segment_address);
            }
        }

        let mut hdr = if dependent_slice_segment_flag {
            let independent = last_independent.ok_or_else(|| {
                anyhow!("dependent slice segment without a preceding independent segment")
            })?;
            SliceHeader {
                header_bit_size: 0,
                ..independent.clone()
            }
        } else {
            let mut hdr = SliceHeader::default();
            Self::parse_independent_fields(&mut r, &mut hdr, nalu_type, &sps, &pps)?;
            hdr
        };

        hdr.first_slice_segment_in_pic_flag = first_slice_segment_in_pic_flag;
        hdr.no_output_of_prior_pics_flag = no_output_of_prior_pics_flag;
        hdr.pic_parameter_set_id = pic_parameter_set_id;
        hdr.dependent_slice_segment_flag = dependent_slice_segment_flag;
        hdr.segment_address = segment_address;

        r.byte_alignment().context("missing byte_alignment()")?;
        hdr.header_bit_size = u32::try_from(r.num_bits_read())?;

        Ok(Slice { header: hdr, nalu })
    }

    fn parse_independent_fields(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
        nalu_type: NaluType,
        sps: &Sps,
        pps: &Pps,
    ) -> anyhow::Result<()> {
        r.skip_bits(usize::from(pps.num_extra_slice_header_bits))?;

        let slice_type: u8 = r.read_ue_max(2)?;
        hdr.type_ = SliceType::n(slice_type).ok_or_else(|| anyhow!("invalid slice_type"))?;

        if pps.output_flag_present_flag {
            hdr.pic_output_flag = r.read_bit()?;
        }

        if !nalu_type.is_idr() {
            Self::parse_poc_and_references(r, hdr, sps)?;
        }

        if sps.alf_enabled_flag {
            hdr.alf_enabled_flag = r.read_bit()?;
            if hdr.alf_enabled_flag {
                hdr.adaptation_parameter_set_id = r.read_bits(5)?;
            }
        }

        Ok(())
    }

    fn parse_poc_and_references(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
        sps: &Sps,
    ) -> anyhow::Result<()> {
        hdr.pic_order_cnt_lsb = r.read_bits(sps.log2_max_pic_order_cnt_lsb() as usize)?;
        hdr.short_term_ref_pic_set_sps_flag = r.read_bit()?;

        let num_sets = sps.short_term_ref_pic_sets.len();
        if !hdr.short_term_ref_pic_set_sps_flag {
            hdr.short_term_ref_pic_set = ShortTermRefPicSet::parse(r)?;
        } else {
            if num_sets == 0 {
                bail!("short_term_ref_pic_set_sps_flag set but the SPS has no sets");
            }
            if num_sets > 1 {
                hdr.short_term_ref_pic_set_idx = r.read_bits(ceil_log2(num_sets as u32))?;
            }
            if usize::from(hdr.short_term_ref_pic_set_idx) >= num_sets {
                bail!(
                    "short_term_ref_pic_set_idx {} out of range",
                    hdr.short_term_ref_pic_set_idx
                );
            }
        }

        if sps.long_term_ref_pics_present_flag {
            let num_long_term_pics: usize = r.read_ue_max(MAX_LONG_TERM_REF_PICS as u32)?;
            for _ in 0..num_long_term_pics {
                let mut lt = LongTermRefPic {
                    poc_lsb_lt: r.read_bits(sps.log2_max_pic_order_cnt_lsb() as usize)?,
                    used_by_curr_pic_lt_flag: r.read_bit()?,
                    delta_poc_msb_present_flag: r.read_bit()?,
                    delta_poc_msb_cycle_lt: 0,
                };
                if lt.delta_poc_msb_present_flag {
                    lt.delta_poc_msb_cycle_lt = r.read_ue()?;
                }
                hdr.long_term_refs.push(lt);
            }
        }

        Ok(())
    }
}
