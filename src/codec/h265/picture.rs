// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use crate::codec::h265::parser::Aps;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::sei::SeiMessage;
use crate::video_frame::Geometry;
use crate::video_frame::VideoFrame;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// A slice segment once it has been attached to its picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceSegment {
    pub header: SliceHeader,
    pub nalu_type: NaluType,
    pub temporal_id: u8,
    /// Position of the segment in decoding order within its picture.
    pub index: usize,
}

/// A slot of the picture pool, along with the state of the picture it currently holds.
#[derive(Clone, Debug)]
pub struct Picture {
    pub poc: i32,
    pub temporal_id: u8,
    pub nalu_type: NaluType,
    reference: Reference,
    pub needed_for_output: bool,
    pub reconstructed: bool,
    pub pic_output_flag: bool,
    pub field_pic: bool,
    pub top_field: bool,
    /// Whether the samples were produced by concealment rather than decoding.
    pub synthesized: bool,
    frame: Rc<VideoFrame>,
    slices: Vec<SliceSegment>,
    seis: Vec<SeiMessage>,
    sps: Option<Rc<Sps>>,
    pps: Option<Rc<Pps>>,
    aps: Option<Rc<Aps>>,
}

impl Picture {
    pub(crate) fn new(geometry: Geometry) -> Self {
        Self {
            poc: 0,
            temporal_id: 0,
            nalu_type: NaluType::default(),
            reference: Reference::None,
            needed_for_output: false,
            reconstructed: false,
            pic_output_flag: true,
            field_pic: false,
            top_field: false,
            synthesized: false,
            frame: Rc::new(VideoFrame::new(geometry)),
            slices: vec![],
            seis: vec![],
            sps: None,
            pps: None,
            aps: None,
        }
    }

    pub fn geometry(&self) -> Geometry {
        *self.frame.geometry()
    }

    pub fn frame(&self) -> &Rc<VideoFrame> {
        &self.frame
    }

    /// Mutable access to the samples. Frames still held by an output consumer are copied
    /// first.
    pub fn frame_mut(&mut self) -> &mut VideoFrame {
        Rc::make_mut(&mut self.frame)
    }

    pub fn reference(&self) -> Reference {
        self.reference
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!("Set reference of POC {} to {:?}", self.poc, reference);
        self.reference = reference;
    }

    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    /// Whether the picture still holds state the decoder cares about.
    pub fn is_live(&self) -> bool {
        self.is_ref() || self.needed_for_output
    }

    /// Whether the slot can be handed out again.
    pub fn is_reusable(&self) -> bool {
        !self.needed_for_output && (!self.reconstructed || !self.is_ref())
    }

    pub fn slices(&self) -> &[SliceSegment] {
        &self.slices
    }

    pub(crate) fn push_slice(&mut self, slice: SliceSegment) {
        self.slices.push(slice);
    }

    pub fn seis(&self) -> &[SeiMessage] {
        &self.seis
    }

    pub(crate) fn attach_seis(&mut self, seis: impl IntoIterator<Item = SeiMessage>) {
        self.seis.extend(seis);
    }

    pub fn sps(&self) -> Option<&Rc<Sps>> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Rc<Pps>> {
        self.pps.as_ref()
    }

    pub fn aps(&self) -> Option<&Rc<Aps>> {
        self.aps.as_ref()
    }

    pub(crate) fn set_parameter_sets(
        &mut self,
        sps: Rc<Sps>,
        pps: Rc<Pps>,
        aps: Option<Rc<Aps>>,
    ) {
        self.sps = Some(sps);
        self.pps = Some(pps);
        self.aps = aps;
    }

    /// Replaces the sample storage with one allocated for `geometry`.
    pub(crate) fn reallocate(&mut self, geometry: Geometry) {
        log::debug!(
            "Reallocating picture buffers for {}x{}",
            geometry.resolution.width,
            geometry.resolution.height
        );
        self.frame = Rc::new(VideoFrame::new(geometry));
    }

    /// Drops the state of the previous occupant of this slot.
    pub(crate) fn reset(&mut self) {
        self.reference = Reference::None;
        self.needed_for_output = false;
        self.reconstructed = false;
        self.pic_output_flag = true;
        self.field_pic = false;
        self.top_field = false;
        self.synthesized = false;
        self.temporal_id = 0;
        self.slices.clear();
        self.seis.clear();
        self.sps = None;
        self.pps = None;
        self.aps = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_frame::Y_PLANE;

    #[test]
    fn reusable_states() {
        let mut pic = Picture::new(Geometry::default());
        assert!(pic.is_reusable());

        pic.set_reference(Reference::ShortTerm);
        pic.reconstructed = true;
        assert!(!pic.is_reusable());

        pic.needed_for_output = true;
        pic.set_reference(Reference::None);
        assert!(!pic.is_reusable());

        // Never finished decoding, so nothing depends on it.
        pic.needed_for_output = false;
        pic.set_reference(Reference::LongTerm);
        pic.reconstructed = false;
        assert!(pic.is_reusable());
    }

    #[test]
    fn frame_is_copied_when_shared() {
        let mut pic = Picture::new(Geometry {
            resolution: crate::Resolution {
                width: 4,
                height: 4,
            },
            max_cu_size: 16,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            ..Default::default()
        });

        let output = Rc::clone(pic.frame());
        pic.frame_mut().fill_plane(Y_PLANE, 9);

        assert_eq!(output.sample(Y_PLANE, 0, 0), 0);
        assert_eq!(pic.frame().sample(Y_PLANE, 0, 0), 9);
    }
}
