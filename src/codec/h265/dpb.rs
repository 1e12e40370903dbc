// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer.
//!
//! The DPB owns every picture of the session. Slots are recycled once nothing depends on
//! them anymore, and the rest of the decoder refers to them through `PictureHandle`s. Only
//! trailing recyclable slots beyond a lowered bound are ever dropped, so handles of live
//! pictures stay valid.

use std::ops::Index;
use std::ops::IndexMut;

use crate::codec::h265::picture::Picture;
use crate::codec::h265::picture::Reference;
use crate::video_frame::Geometry;

/// Index of a picture slot in the DPB. Valid until the DPB is cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PictureHandle(usize);

impl PictureHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct Dpb {
    /// Picture slots, in allocation order.
    entries: Vec<Picture>,
    /// The current bound on the number of slots.
    max_num_pics: usize,
    /// Number of times the bound had to be raised because no slot could be recycled.
    num_extensions: usize,
}

impl Dpb {
    pub fn pictures(&self) -> impl Iterator<Item = &Picture> {
        self.entries.iter()
    }

    pub fn pictures_mut(&mut self) -> impl Iterator<Item = &mut Picture> {
        self.entries.iter_mut()
    }

    pub fn handles(&self) -> impl Iterator<Item = PictureHandle> {
        (0..self.entries.len()).map(PictureHandle)
    }

    pub fn get(&self, handle: PictureHandle) -> Option<&Picture> {
        self.entries.get(handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    pub fn num_extensions(&self) -> usize {
        self.num_extensions
    }

    /// Returns a picture slot for a new picture, sized for `geometry`.
    ///
    /// A new slot is allocated while the DPB holds fewer than `max_dec_pic_buffering`
    /// (plus previous extensions) pictures. Otherwise the first recyclable slot is reused.
    /// If there is none the stream needs more buffering than it declared: the bound is
    /// raised by one and a slot is allocated anyway.
    pub fn acquire(&mut self, geometry: Geometry, max_dec_pic_buffering: usize) -> PictureHandle {
        self.max_num_pics = max_dec_pic_buffering + self.num_extensions;
        self.trim();

        if self.entries.len() < self.max_num_pics {
            self.entries.push(Picture::new(geometry));
            return PictureHandle(self.entries.len() - 1);
        }

        if let Some(pos) = self.entries.iter().position(Picture::is_reusable) {
            let pic = &mut self.entries[pos];
            if pic.geometry() != geometry {
                pic.reallocate(geometry);
            }
            pic.reset();
            return PictureHandle(pos);
        }

        self.num_extensions += 1;
        self.max_num_pics += 1;
        log::warn!(
            "No reusable picture buffer, extending the DPB to {} pictures",
            self.max_num_pics
        );

        self.entries.push(Picture::new(geometry));
        PictureHandle(self.entries.len() - 1)
    }

    /// Drops the trailing recyclable slots that exceed the bound.
    fn trim(&mut self) {
        while self.entries.len() > self.max_num_pics
            && self.entries.last().is_some_and(Picture::is_reusable)
        {
            self.entries.pop();
        }
    }

    /// Recreates the sample storage of every slot for `geometry`.
    pub fn rebuild(&mut self, geometry: Geometry) {
        log::debug!("Rebuilding {} DPB slots", self.entries.len());

        for pic in &mut self.entries {
            pic.reallocate(geometry);
            pic.reset();
        }
    }

    /// Finds a picture with `poc` that is still in use, excluding `current`.
    pub fn find_live_by_poc(
        &self,
        poc: i32,
        current: Option<PictureHandle>,
    ) -> Option<PictureHandle> {
        self.handles()
            .filter(|&h| Some(h) != current)
            .find(|&h| {
                let pic = &self[h];
                pic.is_live() && pic.poc == poc
            })
    }

    /// Finds a picture in use whose POC matches `poc` on the bits in `mask`.
    pub fn find_live_by_masked_poc(
        &self,
        poc: i32,
        mask: i32,
        current: Option<PictureHandle>,
    ) -> Option<PictureHandle> {
        self.handles()
            .filter(|&h| Some(h) != current)
            .find(|&h| {
                let pic = &self[h];
                pic.is_live() && (pic.poc & mask) == (poc & mask)
            })
    }

    /// Finds the reconstructed picture closest in POC to `poc`, to be used as a stand-in for
    /// it. Pictures at distance 0 and with POC `exclude_poc` are not candidates. Ties go
    /// to the lowest POC.
    pub fn closest_to_poc(&self, poc: i32, exclude_poc: i32) -> Option<PictureHandle> {
        self.handles()
            .filter(|&h| {
                let pic = &self[h];
                pic.reconstructed && pic.poc != poc && pic.poc != exclude_poc
            })
            .min_by_key(|&h| ((i64::from(self[h].poc) - i64::from(poc)).abs(), self[h].poc))
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for pic in &mut self.entries {
            pic.set_reference(Reference::None);
        }
    }

    /// Handles sorted by POC. Slots with equal POCs keep their allocation order.
    pub fn output_order(&self) -> Vec<PictureHandle> {
        let mut handles = self.handles().collect::<Vec<_>>();
        handles.sort_by_key(|&h| self[h].poc);
        handles
    }

    /// Outputs pictures until the reorder and buffering bounds are met, and returns them
    /// in output order.
    ///
    /// Pictures still waiting for output count against both bounds, pictures only kept
    /// for reference count against `max_dec_pic_buffering`.
    pub fn write_output(
        &mut self,
        num_reorder_pics: usize,
        max_dec_pic_buffering: usize,
        last_displayed_poc: &mut i32,
    ) -> Vec<PictureHandle> {
        let mut num_pics_not_yet_displayed = 0;
        let mut dpb_fullness = 0;

        for pic in &self.entries {
            if pic.needed_for_output && pic.poc > *last_displayed_poc {
                num_pics_not_yet_displayed += 1;
                dpb_fullness += 1;
            } else if pic.is_ref() {
                dpb_fullness += 1;
            }
        }

        let mut output = vec![];
        for handle in self.output_order() {
            if num_pics_not_yet_displayed <= num_reorder_pics
                && dpb_fullness <= max_dec_pic_buffering
            {
                break;
            }

            let pic = &mut self.entries[handle.0];
            if !pic.needed_for_output {
                continue;
            }
            // Late pictures lose their output flag before they are counted.
            debug_assert!(pic.poc > *last_displayed_poc);

            num_pics_not_yet_displayed -= 1;
            if !pic.is_ref() {
                dpb_fullness -= 1;
                pic.reconstructed = false;
            }

            log::debug!("Outputting POC {}", pic.poc);
            *last_displayed_poc = pic.poc;
            pic.needed_for_output = false;
            output.push(handle);
        }

        output
    }

    /// Outputs every picture waiting for output in POC order and marks every slot as
    /// unused. Pictures that do not come after `last_displayed_poc` are dropped.
    pub fn flush_output(&mut self, last_displayed_poc: &mut i32) -> Vec<PictureHandle> {
        log::debug!("Flushing the DPB");

        self.discard_late_output(*last_displayed_poc);

        let mut output = vec![];
        for handle in self.output_order() {
            let pic = &mut self.entries[handle.0];
            if pic.needed_for_output {
                *last_displayed_poc = pic.poc;
                output.push(handle);
            }
        }

        for pic in &mut self.entries {
            pic.needed_for_output = false;
            pic.reconstructed = false;
            pic.set_reference(Reference::None);
        }

        output
    }

    /// Prevents the output of pictures with a POC not above `last_displayed_poc`, as output
    /// order cannot go backwards.
    pub fn discard_late_output(&mut self, last_displayed_poc: i32) {
        for pic in &mut self.entries {
            if pic.needed_for_output && pic.poc <= last_displayed_poc {
                log::warn!(
                    "POC {} finished after POC {} was output, dropping it",
                    pic.poc,
                    last_displayed_poc
                );
                pic.needed_for_output = false;
            }
        }
    }

    /// Prevents the output of every finished picture but the one with `keep_poc`.
    pub fn discard_output(&mut self, keep_poc: i32) {
        for pic in &mut self.entries {
            if pic.reconstructed && pic.poc != keep_poc && pic.needed_for_output {
                log::debug!("Discarding output of POC {}", pic.poc);
                pic.needed_for_output = false;
            }
        }
    }

    /// Gives mutable access to `target` along with shared access to `refs`, in the order of
    /// `refs`. Returns `None` if `target` is not a valid handle.
    pub fn split_for_decode(
        &mut self,
        target: PictureHandle,
        refs: &[PictureHandle],
    ) -> Option<(&mut Picture, Vec<&Picture>)> {
        let mut target_pic = None;
        let mut references = vec![];

        for (i, pic) in self.entries.iter_mut().enumerate() {
            if i == target.0 {
                target_pic = Some(pic);
            } else if let Some(pos) = refs.iter().position(|h| h.0 == i) {
                references.push((pos, &*pic));
            }
        }

        references.sort_by_key(|(pos, _)| *pos);
        Some((target_pic?, references.into_iter().map(|(_, pic)| pic).collect()))
    }

    /// Drops every picture and resets the bound.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");
        *self = Default::default();
    }
}

impl Index<PictureHandle> for Dpb {
    type Output = Picture;

    fn index(&self, handle: PictureHandle) -> &Picture {
        &self.entries[handle.0]
    }
}

impl IndexMut<PictureHandle> for Dpb {
    fn index_mut(&mut self, handle: PictureHandle) -> &mut Picture {
        &mut self.entries[handle.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_frame::ChromaFormat;
    use crate::Resolution;

    fn geometry(width: u32) -> Geometry {
        Geometry {
            resolution: Resolution { width, height: 16 },
            max_cu_size: 16,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
        }
    }

    /// Decodes a picture with `poc`, keeping the pictures in `refs` as references.
    fn decode(dpb: &mut Dpb, poc: i32, refs: &[i32]) -> PictureHandle {
        for pic in dpb.pictures_mut() {
            if !refs.contains(&pic.poc) {
                pic.set_reference(Reference::None);
            }
        }

        let handle = dpb.acquire(geometry(16), 6);
        let pic = &mut dpb[handle];
        pic.poc = poc;
        pic.set_reference(Reference::ShortTerm);
        pic.reconstructed = true;
        pic.needed_for_output = true;
        handle
    }

    fn pocs(dpb: &Dpb, handles: &[PictureHandle]) -> Vec<i32> {
        handles.iter().map(|&h| dpb[h].poc).collect()
    }

    #[test]
    fn hierarchical_b_output_order() {
        let mut dpb = Dpb::default();
        let mut last = -i32::MAX;
        let mut output = vec![];

        for poc in [0, 8, 4, 2, 1, 3, 6, 5, 7] {
            decode(&mut dpb, poc, &[]);
            let written = dpb.write_output(3, 6, &mut last);
            output.extend(pocs(&dpb, &written));
        }
        let flushed = dpb.flush_output(&mut last);
        output.extend(pocs(&dpb, &flushed));

        assert_eq!(output, (0..=8).collect::<Vec<_>>());
    }

    #[test]
    fn fullness_forces_output() {
        let mut dpb = Dpb::default();
        let mut last = -i32::MAX;

        // Everything is kept as reference, so the buffering bound is exceeded long before
        // the reorder window is and pictures leave as soon as they are decoded.
        let mut refs = vec![];
        let mut output = vec![];
        for poc in 0..4 {
            decode(&mut dpb, poc, &refs);
            refs.push(poc);
            let written = dpb.write_output(8, 2, &mut last);
            output.extend(pocs(&dpb, &written));
        }

        assert_eq!(output, vec![0, 1, 2, 3]);
        assert!(dpb.pictures().all(|pic| pic.is_ref() && pic.reconstructed));
    }

    #[test]
    fn acquire_recycles_and_extends() {
        let mut dpb = Dpb::default();

        for poc in 0..2 {
            let h = dpb.acquire(geometry(16), 2);
            dpb[h].poc = poc;
            dpb[h].set_reference(Reference::ShortTerm);
            dpb[h].reconstructed = true;
        }
        assert_eq!(dpb.len(), 2);

        // Nothing recyclable: one extension.
        let h = dpb.acquire(geometry(16), 2);
        assert_eq!(dpb.len(), 3);
        assert_eq!(dpb.num_extensions(), 1);
        assert_eq!(dpb.max_num_pics(), 3);
        dpb[h].poc = 2;
        dpb[h].reconstructed = true;
        dpb[h].needed_for_output = true;

        // Unreferenced and already output: recycled in place, with new buffers.
        dpb[PictureHandle(0)].set_reference(Reference::None);
        let h = dpb.acquire(geometry(32), 2);
        assert_eq!(h, PictureHandle(0));
        assert_eq!(dpb.len(), 3);
        assert_eq!(dpb.num_extensions(), 1);
        assert_eq!(dpb[h].geometry().resolution.width, 32);
        assert!(!dpb[h].reconstructed && !dpb[h].needed_for_output);
    }

    #[test]
    fn late_picture_is_never_output() {
        let mut dpb = Dpb::default();
        let mut last = -i32::MAX;
        let mut output = vec![];

        // POC 1 only arrives after POC 2 left the DPB.
        for poc in [0, 2, 1, 3] {
            decode(&mut dpb, poc, &[poc - 1]);
            dpb.discard_late_output(last);
            let written = dpb.write_output(0, 4, &mut last);
            output.extend(pocs(&dpb, &written));
        }
        assert_eq!(output, vec![0, 2, 3]);

        let late = dpb.pictures().find(|pic| pic.poc == 1).unwrap();
        assert!(!late.needed_for_output);

        // Even when it is still pending at flush time.
        let h = dpb.acquire(geometry(16), 4);
        dpb[h].poc = 1;
        dpb[h].reconstructed = true;
        dpb[h].needed_for_output = true;
        assert!(dpb.flush_output(&mut last).is_empty());
        assert_eq!(last, 3);
    }

    #[test]
    fn lowered_bound_trims_free_slots() {
        let mut dpb = Dpb::default();
        for poc in 0..6 {
            let h = dpb.acquire(geometry(16), 6);
            dpb[h].poc = poc;
        }
        assert_eq!(dpb.len(), 6);

        // Only the slot holding a reference must stay.
        dpb[PictureHandle(4)].set_reference(Reference::ShortTerm);
        dpb[PictureHandle(4)].reconstructed = true;

        let h = dpb.acquire(geometry(16), 2);
        assert_eq!(h, PictureHandle(0));
        assert_eq!(dpb.len(), 5);
        assert_eq!(dpb[PictureHandle(4)].poc, 4);

        dpb[PictureHandle(4)].set_reference(Reference::None);
        dpb.acquire(geometry(16), 2);
        assert_eq!(dpb.len(), 2);
        assert_eq!(dpb.num_extensions(), 0);
    }

    #[test]
    fn closest_ties_go_to_lowest_poc() {
        let mut dpb = Dpb::default();
        for poc in [4, 8, 0] {
            let h = dpb.acquire(geometry(16), 4);
            dpb[h].poc = poc;
            dpb[h].reconstructed = true;
        }

        let closest = dpb.closest_to_poc(6, i32::MIN).unwrap();
        assert_eq!(dpb[closest].poc, 4);

        let closest = dpb.closest_to_poc(6, 4).unwrap();
        assert_eq!(dpb[closest].poc, 8);
    }

    #[test]
    fn split_for_decode_keeps_reference_order() {
        let mut dpb = Dpb::default();
        let handles = [0, 1, 2].map(|poc| {
            let h = dpb.acquire(geometry(16), 4);
            dpb[h].poc = poc;
            h
        });

        let (target, refs) = dpb
            .split_for_decode(handles[1], &[handles[2], handles[0]])
            .unwrap();
        target.poc = 10;
        assert_eq!(refs.iter().map(|p| p.poc).collect::<Vec<_>>(), vec![2, 0]);
    }
}
