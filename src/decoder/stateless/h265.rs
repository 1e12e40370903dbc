// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dummy;
pub mod random_access;
pub mod rps;

use std::rc::Rc;

use anyhow::anyhow;

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::PictureHandle;
use crate::codec::h265::param_sets::ParameterSetKind;
use crate::codec::h265::param_sets::ParameterSetStore;
use crate::codec::h265::parser::Aps;
use crate::codec::h265::parser::Nalu;
use crate::codec::h265::parser::NaluClass;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::picture::Picture;
use crate::codec::h265::picture::Reference;
use crate::codec::h265::picture::SliceSegment;
use crate::codec::h265::sei::parse_sei;
use crate::codec::h265::sei::SeiMessage;
use crate::decoder::stateless::h265::random_access::RandomAccessState;
use crate::decoder::stateless::h265::random_access::SkipDecision;
use crate::decoder::stateless::h265::rps::synthesize_lost_picture;
use crate::decoder::stateless::h265::rps::RefPicSet;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::DecodingState;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::DecodeStatus;
use crate::decoder::DecoderConfig;
use crate::decoder::FinishedPicture;
use crate::decoder::OutputPicture;
use crate::video_frame::Geometry;

/// Stateless backend methods specific to H.265.
pub trait StatelessH265DecoderBackend {
    /// Called when a new SPS is activated.
    fn new_sequence(&mut self, sps: &Sps) -> StatelessBackendResult<()>;

    /// Called once the first slice of `picture` has been received and its references have
    /// been resolved.
    fn begin_picture(
        &mut self,
        picture: &mut Picture,
        sps: &Sps,
        pps: &Pps,
    ) -> StatelessBackendResult<()>;

    /// Called to dispatch a decode operation to the backend. `references` are the pictures
    /// the current one predicts from, in the order StCurrBefore, StCurrAfter, LtCurr.
    /// `payload` is the RBSP of the slice NAL unit, header included.
    fn decode_slice(
        &mut self,
        picture: &mut Picture,
        references: &[&Picture],
        slice: &SliceSegment,
        payload: &[u8],
    ) -> StatelessBackendResult<()>;

    /// Called when every slice of `picture` has been submitted.
    fn finish_picture(&mut self, picture: &mut Picture) -> StatelessBackendResult<()>;
}

/// Where the last slice segment received stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PilotState {
    #[default]
    Idle,
    HeaderParsed,
    /// The slice belongs to a picture that is not decoded.
    Skipped,
    /// The slice opens a new picture.
    Activating,
    /// The slice has been attached to the current picture and sent to the backend.
    Attached,
}

/// Staging record for the slice segment being processed.
#[derive(Debug, Default)]
struct SlicePilot {
    state: PilotState,
    nalu_type: NaluType,
    temporal_id: u8,
    poc: i32,
    /// Header of the last independent slice segment. Dependent segments inherit from it.
    last_independent: Option<SliceHeader>,
}

/// Flags derived for the picture an independent slice segment belongs to. 8.1.3.
#[derive(Clone, Copy, Debug)]
struct PictureFlags {
    poc: i32,
    no_rasl_output_flag: bool,
    no_output_of_prior_pics: bool,
    pic_output_flag: bool,
}

/// The picture currently being decoded.
struct CurrentPicState {
    handle: PictureHandle,
    rps: RefPicSet,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    aps: Option<Rc<Aps>>,
}

/// Derives PicOrderCntVal from the POC LSBs of a slice. 8.3.1.
fn compute_poc(nalu_type: NaluType, poc_lsb: i32, max_poc_lsb: i32, prev_tid0_poc: i32) -> i32 {
    if nalu_type.is_idr() {
        return 0;
    }

    let prev_poc_lsb = prev_tid0_poc & (max_poc_lsb - 1);
    let prev_poc_msb = prev_tid0_poc - prev_poc_lsb;

    let poc_msb = if nalu_type.is_bla() {
        0
    } else if poc_lsb < prev_poc_lsb && prev_poc_lsb - poc_lsb >= max_poc_lsb / 2 {
        prev_poc_msb + max_poc_lsb
    } else if poc_lsb > prev_poc_lsb && poc_lsb - prev_poc_lsb > max_poc_lsb / 2 {
        prev_poc_msb - max_poc_lsb
    } else {
        prev_poc_msb
    };

    poc_msb + poc_lsb
}

/// Applies the frame/field information of a picture timing message.
fn apply_picture_timing(pic: &mut Picture, seis: &[SeiMessage]) {
    for sei in seis {
        if let SeiMessage::PictureTiming(timing) = sei {
            pic.field_pic = timing.is_field();
            pic.top_field = timing.is_top_field();
        }
    }
}

pub struct H265DecoderState {
    parser: Parser,

    /// The decoded picture buffer.
    dpb: Dpb,

    pilot: SlicePilot,

    /// The picture being decoded, if any.
    current_pic: Option<CurrentPicState>,

    random_access: RandomAccessState,

    /// SPS of the current sequence.
    active_sps: Option<Rc<Sps>>,

    /// POC of the previous picture with TemporalId 0 that is not a RASL, RADL or SLNR
    /// picture.
    prev_tid0_poc: i32,
    /// POC of the previous independent slice segment that was not skipped.
    prev_poc: i32,
    skipped_poc: i32,
    prev_slice_skipped: bool,
    first_slice_in_sequence: bool,
    first_slice_in_bitstream: bool,
    /// NoRaslOutputFlag of the last CRA picture.
    cra_no_rasl_output_flag: bool,

    /// POC of the last picture output.
    last_displayed_poc: i32,

    /// Prefix SEI messages waiting for the next picture.
    pending_prefix_seis: Vec<SeiMessage>,

    /// Pictures output by a drain that no finished picture has returned yet.
    pending_output: Vec<OutputPicture>,
}

impl H265DecoderState {
    pub(crate) fn new(config: &DecoderConfig) -> Self {
        Self {
            parser: Default::default(),
            dpb: Default::default(),
            pilot: Default::default(),
            current_pic: None,
            random_access: RandomAccessState::new(config.skip_frames),
            active_sps: None,
            prev_tid0_poc: 0,
            prev_poc: i32::MAX,
            skipped_poc: 0,
            prev_slice_skipped: false,
            first_slice_in_sequence: true,
            first_slice_in_bitstream: true,
            cra_no_rasl_output_flag: false,
            last_displayed_poc: -i32::MAX,
            pending_prefix_seis: vec![],
            pending_output: vec![],
        }
    }
}

impl<B: StatelessH265DecoderBackend> StatelessDecoder<B> {
    /// Processes one NAL unit.
    ///
    /// Any error is fatal: the decoder is torn down before it is returned.
    pub fn decode(&mut self, nalu: &Nalu) -> Result<DecodeStatus, DecodeError> {
        if self.is_aborted() {
            return Err(DecodeError::Aborted);
        }

        self.process_nalu(nalu).map_err(|e| {
            log::error!("Fatal decoding error: {}", e);
            self.teardown();
            e
        })
    }

    /// Finishes the current picture and runs the output process. Returns `None` if no
    /// picture was being decoded.
    pub fn finish_picture(&mut self) -> Result<Option<FinishedPicture>, DecodeError> {
        if self.is_aborted() {
            return Err(DecodeError::Aborted);
        }

        let Some(pic) = self.codec.current_pic.take() else {
            return Ok(None);
        };

        self.finish_current_picture(pic).map(Some).map_err(|e| {
            log::error!("Fatal error while finishing picture: {}", e);
            self.teardown();
            e
        })
    }

    /// Finishes the current picture if any, then outputs every pending picture and empties
    /// the DPB. Decoding may resume from the next random access point.
    pub fn flush(&mut self) -> Result<Vec<OutputPicture>, DecodeError> {
        let mut output = match self.finish_picture()? {
            Some(finished) => finished.output,
            None => std::mem::take(&mut self.codec.pending_output),
        };

        output.extend(self.drain());
        self.codec.dpb.clear();
        self.reset_sequence();

        Ok(output)
    }

    /// Releases every picture and parameter set. The decoder rejects any further input.
    pub fn teardown(&mut self) {
        log::debug!("Tearing down the decoder");

        self.codec.current_pic = None;
        self.codec.dpb.clear();
        self.codec.parser.parameter_sets_mut().clear();
        self.codec.pending_prefix_seis.clear();
        self.codec.pending_output.clear();
        self.codec.active_sps = None;
        self.codec.pilot = Default::default();
        self.ready_queue.clear();
        self.decoding_state = DecodingState::Aborted;
    }

    pub fn pilot_state(&self) -> PilotState {
        self.codec.pilot.state
    }

    pub fn dpb(&self) -> &Dpb {
        &self.codec.dpb
    }

    pub fn parameter_sets(&self) -> &ParameterSetStore {
        self.codec.parser.parameter_sets()
    }

    pub fn random_access(&self) -> &RandomAccessState {
        &self.codec.random_access
    }

    pub fn last_displayed_poc(&self) -> i32 {
        self.codec.last_displayed_poc
    }

    fn process_nalu(&mut self, nalu: &Nalu) -> Result<DecodeStatus, DecodeError> {
        let nalu_type = nalu.header.nalu_type();
        log::debug!(
            "Processing NALU {:?}, length is {}",
            nalu_type,
            nalu.size()
        );

        if nalu.header.nuh_layer_id() > 0 {
            log::warn!(
                "Discarding {:?} of layer {}, only the base layer is decoded",
                nalu_type,
                nalu.header.nuh_layer_id()
            );
            self.stats.discarded_units += 1;
            return Ok(DecodeStatus::Consumed);
        }

        match nalu_type.class() {
            NaluClass::Slice => return self.process_slice(nalu),
            NaluClass::VideoParameterSet => log::debug!("Ignoring VPS"),
            NaluClass::ParameterSet(ParameterSetKind::Sps) => {
                self.codec.parser.parse_sps(nalu)?;
            }
            NaluClass::ParameterSet(ParameterSetKind::Pps) => {
                self.codec.parser.parse_pps(nalu)?;
            }
            NaluClass::ParameterSet(ParameterSetKind::Aps) => {
                self.codec.parser.parse_aps(nalu)?;
            }
            NaluClass::AccessUnitDelimiter | NaluClass::FillerData => {
                log::info!("Discarding {:?}", nalu_type);
                self.stats.discarded_units += 1;
            }
            NaluClass::EndOfSequence | NaluClass::EndOfBitstream => {
                if self.codec.current_pic.is_some() {
                    return Ok(DecodeStatus::NewPicture);
                }
                self.end_of_sequence();
            }
            NaluClass::PrefixSei => match parse_sei(nalu) {
                Ok(messages) => self.codec.pending_prefix_seis.extend(messages),
                Err(e) => log::warn!("Discarding malformed prefix SEI: {:#}", e),
            },
            NaluClass::SuffixSei => match (parse_sei(nalu), &self.codec.current_pic) {
                (Ok(messages), Some(pic)) => self.codec.dpb[pic.handle].attach_seis(messages),
                (Ok(_), None) => log::info!("Discarding suffix SEI received outside a picture"),
                (Err(e), _) => log::warn!("Discarding malformed suffix SEI: {:#}", e),
            },
            NaluClass::ReservedVcl => {
                log::info!("Discarding reserved {:?}", nalu_type);
                self.codec.pending_prefix_seis.clear();
                self.stats.discarded_units += 1;
            }
            NaluClass::ReservedNonVcl | NaluClass::Unspecified => {
                log::info!("Discarding {:?}", nalu_type);
                self.stats.discarded_units += 1;
            }
        }

        Ok(DecodeStatus::Consumed)
    }

    fn process_slice(&mut self, nalu: &Nalu) -> Result<DecodeStatus, DecodeError> {
        let codec = &mut self.codec;
        codec.pilot.state = PilotState::Idle;

        let slice = codec
            .parser
            .parse_slice_header(nalu.clone(), codec.pilot.last_independent.as_ref())?;
        let hdr = &slice.header;
        let nalu_type = nalu.header.nalu_type();
        let temporal_id = nalu.header.temporal_id();

        let pps = codec.parser.parameter_sets().pps.get(hdr.pic_parameter_set_id)?;
        let sps = codec.parser.parameter_sets().sps.get(pps.seq_parameter_set_id)?;

        codec.pilot.state = PilotState::HeaderParsed;
        codec.pilot.nalu_type = nalu_type;
        codec.pilot.temporal_id = temporal_id;

        if hdr.dependent_slice_segment_flag {
            if codec.prev_slice_skipped {
                codec.pilot.poc = codec.skipped_poc;
                codec.pilot.state = PilotState::Skipped;
                return Ok(DecodeStatus::Consumed);
            }

            let Some(pic) = &codec.current_pic else {
                log::warn!("Discarding a dependent slice segment with no picture to attach to");
                self.stats.discarded_units += 1;
                return Ok(DecodeStatus::Consumed);
            };
            codec.pilot.poc = codec.dpb[pic.handle].poc;

            return self.attach_slice(slice, nalu_type, temporal_id);
        }

        codec.pilot.last_independent = Some(hdr.clone());

        let max_poc_lsb = sps.max_pic_order_cnt_lsb();
        let mut poc = compute_poc(
            nalu_type,
            hdr.pic_order_cnt_lsb as i32,
            max_poc_lsb,
            codec.prev_tid0_poc,
        );

        // The open picture ends when a slice of another picture shows up. Nothing has been
        // changed yet, so the same unit can be submitted again once it is finished.
        if let Some(pic) = &codec.current_pic {
            if hdr.segment_address == 0 || poc != codec.dpb[pic.handle].poc {
                log::debug!("Slice of POC {} starts a new picture", poc);
                return Ok(DecodeStatus::NewPicture);
            }
        }

        let no_rasl_output_flag = nalu_type.is_irap()
            && (nalu_type.is_idr() || nalu_type.is_bla() || codec.first_slice_in_sequence);
        if nalu_type.is_cra() {
            codec.cra_no_rasl_output_flag = no_rasl_output_flag;
            if no_rasl_output_flag {
                poc &= max_poc_lsb - 1;
            }
        }

        if temporal_id == 0 && !nalu_type.is_rasl() && !nalu_type.is_radl() && !nalu_type.is_slnr()
        {
            codec.prev_tid0_poc = poc;
        }

        let flags = PictureFlags {
            poc,
            no_rasl_output_flag,
            no_output_of_prior_pics: nalu_type.is_irap()
                && no_rasl_output_flag
                && !codec.first_slice_in_bitstream
                && (nalu_type.is_cra() || hdr.no_output_of_prior_pics_flag),
            pic_output_flag: !(nalu_type.is_rasl() && codec.cra_no_rasl_output_flag)
                && hdr.pic_output_flag,
        };
        codec.pilot.poc = poc;

        // Later slices of a skipped picture.
        if codec.prev_slice_skipped
            && !hdr.first_slice_segment_in_pic_flag
            && poc == codec.skipped_poc
        {
            codec.pilot.state = PilotState::Skipped;
            return Ok(DecodeStatus::Consumed);
        }

        let warned = codec.random_access.warned_invalid_entry();
        let decision = codec
            .random_access
            .check(nalu_type, poc, &mut codec.last_displayed_poc);
        if !warned && codec.random_access.warned_invalid_entry() {
            self.stats.invalid_entry_points += 1;
        }

        if let SkipDecision::Skip(reason) = decision {
            log::debug!("Skipping POC {} ({:?})", poc, reason);
            codec.prev_slice_skipped = true;
            codec.skipped_poc = poc;
            codec.pending_prefix_seis.clear();
            codec.pilot.state = PilotState::Skipped;
            self.stats.skipped_pictures += 1;
            return Ok(DecodeStatus::Consumed);
        }
        codec.prev_slice_skipped = false;

        if poc != codec.prev_poc && !codec.first_slice_in_sequence && hdr.segment_address != 0 {
            log::warn!(
                "Slice of POC {} starts at address {}, the first slice of the picture might \
                 have been lost",
                poc,
                hdr.segment_address
            );
        }
        codec.prev_poc = poc;

        if codec.current_pic.is_none() {
            self.activate_picture(hdr, nalu_type, temporal_id, sps, pps, flags)?;
        }

        self.attach_slice(slice, nalu_type, temporal_id)
    }

    /// Sets up the current picture from the first slice received for it.
    fn activate_picture(
        &mut self,
        hdr: &SliceHeader,
        nalu_type: NaluType,
        temporal_id: u8,
        sps: Rc<Sps>,
        pps: Rc<Pps>,
        flags: PictureFlags,
    ) -> Result<(), DecodeError> {
        let poc = flags.poc;
        self.codec.pilot.state = PilotState::Activating;
        log::debug!("Activating {:?} picture with POC {}", nalu_type, poc);

        let sets = self.codec.parser.parameter_sets_mut();
        let aps = if hdr.alf_enabled_flag {
            let aps = sets.aps.get(hdr.adaptation_parameter_set_id)?;
            sets.aps.clear_changed(hdr.adaptation_parameter_set_id);
            Some(aps)
        } else {
            None
        };
        sets.sps.clear_changed(sps.seq_parameter_set_id);
        sets.pps.clear_changed(pps.pic_parameter_set_id);

        let geometry = sps.geometry();
        if !geometry.is_valid() || geometry.bit_depth_luma > 16 || geometry.bit_depth_chroma > 16
        {
            return Err(DecodeError::InvalidGeometry(format!(
                "SPS {} describes {:?}",
                sps.seq_parameter_set_id, geometry
            )));
        }

        if nalu_type.is_irap() && flags.no_rasl_output_flag && !self.codec.first_slice_in_bitstream
        {
            if flags.no_output_of_prior_pics {
                log::info!("POC {} discards the pictures waiting for output", poc);
                self.codec.dpb.discard_output(poc);
            }
            let drained = self.drain();
            self.codec.pending_output.extend(drained);
            self.codec.dpb.clear();
        }

        if self.codec.active_sps.as_deref() != Some(&*sps) {
            let geometry_changed = self.codec.active_sps.as_ref().map(|s| s.geometry())
                != Some(geometry);
            if geometry_changed && !self.codec.dpb.is_empty() {
                log::info!("Stream geometry changed, rebuilding the DPB");
                let drained = self.drain();
                self.codec.pending_output.extend(drained);
                self.codec.dpb.rebuild(geometry);
            }

            self.backend.new_sequence(&sps)?;
            self.decoding_state = DecodingState::Decoding;
            self.codec.active_sps = Some(Rc::clone(&sps));
        }

        let max_dec_pic_buffering = sps.max_dec_pic_buffering(sps.highest_tid());

        let mut rps = RefPicSet::derive(hdr, &sps, nalu_type, poc);
        self.recover_lost_references(&rps, poc, geometry, max_dec_pic_buffering);
        rps.resolve_and_mark(&mut self.codec.dpb, None);
        self.codec
            .random_access
            .check_irap_references(nalu_type, poc, rps.short_term_pocs());

        let num_extensions = self.codec.dpb.num_extensions();
        let handle = self.codec.dpb.acquire(geometry, max_dec_pic_buffering);
        self.stats.pool_extensions += (self.codec.dpb.num_extensions() - num_extensions) as u64;

        let seis = std::mem::take(&mut self.codec.pending_prefix_seis);
        let pic = &mut self.codec.dpb[handle];
        pic.poc = poc;
        pic.temporal_id = temporal_id;
        pic.nalu_type = nalu_type;
        pic.pic_output_flag = flags.pic_output_flag;
        pic.set_reference(Reference::ShortTerm);
        pic.set_parameter_sets(Rc::clone(&sps), Rc::clone(&pps), aps.clone());
        apply_picture_timing(pic, &seis);
        pic.attach_seis(seis);

        self.backend.begin_picture(pic, &sps, &pps)?;

        self.codec.current_pic = Some(CurrentPicState {
            handle,
            rps,
            sps,
            pps,
            aps,
        });
        self.codec.first_slice_in_sequence = false;
        self.codec.first_slice_in_bitstream = false;

        Ok(())
    }

    /// Inserts a stand-in for every missing reference of the picture with `poc`. 8.3.3.
    fn recover_lost_references(
        &mut self,
        rps: &RefPicSet,
        poc: i32,
        geometry: Geometry,
        max_dec_pic_buffering: usize,
    ) {
        let codec = &mut self.codec;

        for _ in 0..rps.poc_st_curr_before.len() + rps.poc_st_curr_after.len() {
            let threshold = codec.random_access.anchor().threshold();
            let Some(lost_poc) = rps.first_lost_reference(&codec.dpb, threshold, None) else {
                break;
            };

            let num_extensions = codec.dpb.num_extensions();
            let handle = synthesize_lost_picture(
                &mut codec.dpb,
                lost_poc,
                poc,
                geometry,
                max_dec_pic_buffering,
            );
            self.stats.pool_extensions += (codec.dpb.num_extensions() - num_extensions) as u64;

            // Output order must not go backwards.
            if lost_poc <= codec.last_displayed_poc {
                codec.dpb[handle].needed_for_output = false;
            }

            codec.random_access.set_anchor_if_unset(lost_poc);
            self.stats.lost_pictures_recovered += 1;
        }
    }

    /// Attaches a slice segment to the current picture and sends it to the backend.
    fn attach_slice(
        &mut self,
        slice: Slice,
        nalu_type: NaluType,
        temporal_id: u8,
    ) -> Result<DecodeStatus, DecodeError> {
        let Some(cur) = &self.codec.current_pic else {
            return Err(DecodeError::MalformedNalu(anyhow!(
                "slice segment without a current picture"
            )));
        };
        let handle = cur.handle;
        let references = cur.rps.curr_references();
        let index = self.codec.dpb[handle].slices().len();

        if index > 0 {
            self.check_parameter_sets_unchanged(cur, slice.header.pic_parameter_set_id)?;
        }

        let segment = SliceSegment {
            header: slice.header,
            nalu_type,
            temporal_id,
            index,
        };
        self.codec.dpb[handle].push_slice(segment.clone());

        let (pic, references) = self
            .codec
            .dpb
            .split_for_decode(handle, &references)
            .ok_or_else(|| StatelessBackendError::Other(anyhow!("invalid picture handle")))?;
        self.backend
            .decode_slice(pic, &references, &segment, slice.nalu.payload())?;

        self.codec.pilot.state = PilotState::Attached;
        Ok(DecodeStatus::Consumed)
    }

    /// Parameter sets cannot change while a picture that uses them is being decoded.
    fn check_parameter_sets_unchanged(
        &self,
        cur: &CurrentPicState,
        pps_id: u8,
    ) -> Result<(), DecodeError> {
        if pps_id != cur.pps.pic_parameter_set_id {
            return Err(DecodeError::MalformedNalu(anyhow!(
                "slice refers to PPS {} while its picture uses PPS {}",
                pps_id,
                cur.pps.pic_parameter_set_id
            )));
        }

        let sets = self.codec.parser.parameter_sets();
        let mut in_use = vec![
            (ParameterSetKind::Sps, cur.sps.seq_parameter_set_id),
            (ParameterSetKind::Pps, cur.pps.pic_parameter_set_id),
        ];
        if let Some(aps) = &cur.aps {
            in_use.push((ParameterSetKind::Aps, aps.adaptation_parameter_set_id));
        }

        match in_use
            .into_iter()
            .find(|&(kind, id)| sets.is_changed(kind, id))
        {
            Some((kind, id)) => Err(DecodeError::ParameterSetChanged { kind, id }),
            None => Ok(()),
        }
    }

    fn finish_current_picture(
        &mut self,
        cur: CurrentPicState,
    ) -> Result<FinishedPicture, DecodeError> {
        let handle = cur.handle;
        log::debug!("Finishing picture POC {}", self.codec.dpb[handle].poc);

        self.backend.finish_picture(&mut self.codec.dpb[handle])?;

        if self.config.verify_picture_hash {
            self.verify_picture_hash(handle);
        }

        let pic = &mut self.codec.dpb[handle];
        pic.needed_for_output = pic.pic_output_flag;
        pic.reconstructed = true;
        let poc = pic.poc;
        self.stats.pictures_decoded += 1;

        self.codec.dpb.discard_late_output(self.codec.last_displayed_poc);

        let tid = cur.sps.highest_tid();
        let handles = self.codec.dpb.write_output(
            cur.sps.max_num_reorder_pics(tid),
            cur.sps.max_dec_pic_buffering(tid),
            &mut self.codec.last_displayed_poc,
        );
        let mut output = std::mem::take(&mut self.codec.pending_output);
        output.extend(self.emit(handles));

        Ok(FinishedPicture {
            poc,
            handle,
            output,
        })
    }

    /// Checks the samples of a finished picture against its decoded picture hash messages.
    fn verify_picture_hash(&mut self, handle: PictureHandle) {
        let pic = &self.codec.dpb[handle];

        for sei in pic.seis() {
            let SeiMessage::DecodedPictureHash(hash) = sei else {
                continue;
            };

            self.stats.hash_checks += 1;
            if hash.matches(pic.frame()) {
                log::debug!("POC {}: {:?} hash matches", pic.poc, hash.hash_type);
            } else {
                log::warn!("POC {}: {:?} hash mismatch", pic.poc, hash.hash_type);
                self.stats.hash_mismatches += 1;
            }
        }
    }

    /// Outputs every picture waiting for output and releases every reference.
    fn drain(&mut self) -> Vec<OutputPicture> {
        let handles = self.codec.dpb.flush_output(&mut self.codec.last_displayed_poc);
        self.codec.last_displayed_poc = -i32::MAX;
        self.emit(handles)
    }

    fn emit(&mut self, handles: Vec<PictureHandle>) -> Vec<OutputPicture> {
        let output = handles
            .into_iter()
            .map(|handle| OutputPicture::from(&self.codec.dpb[handle]))
            .collect::<Vec<_>>();

        self.stats.pictures_output += output.len() as u64;
        self.ready_queue.extend(output.iter().cloned());

        output
    }

    fn end_of_sequence(&mut self) {
        log::debug!("End of sequence");
        let drained = self.drain();
        self.codec.pending_output.extend(drained);
        self.codec.dpb.clear();
        self.reset_sequence();
    }

    /// Forgets the current coded video sequence. The next slice starts a new one.
    fn reset_sequence(&mut self) {
        let codec = &mut self.codec;

        codec.random_access.reset();
        codec.prev_poc = i32::MAX;
        codec.prev_slice_skipped = false;
        codec.skipped_poc = 0;
        codec.first_slice_in_sequence = true;
        codec.pilot.last_independent = None;
        codec.last_displayed_poc = -i32::MAX;
    }
}

impl<B: StatelessH265DecoderBackend> Drop for StatelessDecoder<B> {
    fn drop(&mut self) {
        if !self.is_aborted() {
            self.teardown();
        }
    }
}
