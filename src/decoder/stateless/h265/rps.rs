// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture set derivation and marking, plus the concealment of lost references.

use std::rc::Rc;

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::PictureHandle;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::picture::Reference;
use crate::video_frame::Geometry;

/// A long-term entry of the reference picture set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LongTermPoc {
    pub poc: i32,
    /// If unset only the LSBs of `poc` are significant.
    pub msb_present: bool,
}

/// The RefPicSet data, derived once per picture. 8.3.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicSet {
    pub poc_st_curr_before: Vec<i32>,
    pub poc_st_curr_after: Vec<i32>,
    pub poc_st_foll: Vec<i32>,
    pub poc_lt_curr: Vec<LongTermPoc>,
    pub poc_lt_foll: Vec<LongTermPoc>,

    /// Mask applied to long-term POCs without MSB information.
    poc_lsb_mask: i32,

    pub ref_pic_set_st_curr_before: Vec<Option<PictureHandle>>,
    pub ref_pic_set_st_curr_after: Vec<Option<PictureHandle>>,
    pub ref_pic_set_st_foll: Vec<Option<PictureHandle>>,
    pub ref_pic_set_lt_curr: Vec<Option<PictureHandle>>,
    pub ref_pic_set_lt_foll: Vec<Option<PictureHandle>>,
}

impl RefPicSet {
    /// Derives the POC lists for a picture with `poc` whose first slice has header `hdr`.
    pub fn derive(hdr: &SliceHeader, sps: &Sps, nalu_type: NaluType, poc: i32) -> Self {
        let mut rps = RefPicSet {
            poc_lsb_mask: sps.max_pic_order_cnt_lsb() - 1,
            ..Default::default()
        };

        if nalu_type.is_idr() {
            return rps;
        }

        let st = hdr.curr_rps(sps);
        for (delta, &used) in st.delta_poc_s0.iter().zip(&st.used_by_curr_pic_s0) {
            if used {
                rps.poc_st_curr_before.push(poc + delta);
            } else {
                rps.poc_st_foll.push(poc + delta);
            }
        }
        for (delta, &used) in st.delta_poc_s1.iter().zip(&st.used_by_curr_pic_s1) {
            if used {
                rps.poc_st_curr_after.push(poc + delta);
            } else {
                rps.poc_st_foll.push(poc + delta);
            }
        }

        let max_lsb = sps.max_pic_order_cnt_lsb();
        let mut delta_poc_msb_cycle_lt = 0i32;
        for lt in &hdr.long_term_refs {
            let mut lt_poc = lt.poc_lsb_lt as i32;
            if lt.delta_poc_msb_present_flag {
                // (7-52)
                delta_poc_msb_cycle_lt += lt.delta_poc_msb_cycle_lt as i32;
                lt_poc += poc - delta_poc_msb_cycle_lt * max_lsb - (poc & (max_lsb - 1));
            }

            let entry = LongTermPoc {
                poc: lt_poc,
                msb_present: lt.delta_poc_msb_present_flag,
            };
            if lt.used_by_curr_pic_lt_flag {
                rps.poc_lt_curr.push(entry);
            } else {
                rps.poc_lt_foll.push(entry);
            }
        }

        rps
    }

    /// All the short-term POCs of the set.
    pub fn short_term_pocs(&self) -> impl Iterator<Item = i32> + '_ {
        self.poc_st_curr_before
            .iter()
            .chain(&self.poc_st_curr_after)
            .chain(&self.poc_st_foll)
            .copied()
    }

    /// Returns the first short-term reference used by the current picture that is not in `dpb`,
    /// provided its POC is not below `anchor_threshold`. References preceding the random access
    /// point are expected to be missing.
    pub fn first_lost_reference(
        &self,
        dpb: &Dpb,
        anchor_threshold: i32,
        current: Option<PictureHandle>,
    ) -> Option<i32> {
        self.poc_st_curr_before
            .iter()
            .chain(&self.poc_st_curr_after)
            .copied()
            .find(|&poc| {
                poc >= anchor_threshold && dpb.find_live_by_poc(poc, current).is_none()
            })
    }

    /// Finds the pictures of the set in `dpb` and updates the reference marking of every
    /// picture but `current`. 8.3.2.
    pub fn resolve_and_mark(&mut self, dpb: &mut Dpb, current: Option<PictureHandle>) {
        let mask = self.poc_lsb_mask;
        let lookup_lt = |dpb: &Dpb, lt: &LongTermPoc| {
            if lt.msb_present {
                dpb.find_live_by_poc(lt.poc, current)
            } else {
                dpb.find_live_by_masked_poc(lt.poc, mask, current)
            }
        };

        self.ref_pic_set_lt_curr = self
            .poc_lt_curr
            .iter()
            .map(|lt| lookup_lt(&*dpb, lt))
            .collect();
        self.ref_pic_set_lt_foll = self
            .poc_lt_foll
            .iter()
            .map(|lt| lookup_lt(&*dpb, lt))
            .collect();

        let lookup_st = |pocs: &[i32]| {
            pocs.iter()
                .map(|&poc| dpb.find_live_by_poc(poc, current))
                .collect::<Vec<_>>()
        };
        self.ref_pic_set_st_curr_before = lookup_st(&self.poc_st_curr_before);
        self.ref_pic_set_st_curr_after = lookup_st(&self.poc_st_curr_after);
        self.ref_pic_set_st_foll = lookup_st(&self.poc_st_foll);

        for (pocs, handles) in [
            (&self.poc_st_foll, &self.ref_pic_set_st_foll),
            (&self.poc_st_curr_before, &self.ref_pic_set_st_curr_before),
            (&self.poc_st_curr_after, &self.ref_pic_set_st_curr_after),
        ] {
            for (poc, handle) in pocs.iter().zip(handles) {
                if handle.is_none() {
                    log::warn!("No reference found for POC {}", poc);
                }
            }
        }
        for (lts, handles) in [
            (&self.poc_lt_curr, &self.ref_pic_set_lt_curr),
            (&self.poc_lt_foll, &self.ref_pic_set_lt_foll),
        ] {
            for (lt, handle) in lts.iter().zip(handles) {
                if handle.is_none() {
                    log::warn!("No long-term reference found for POC {}", lt.poc);
                }
            }
        }

        let long_term = self
            .ref_pic_set_lt_curr
            .iter()
            .chain(&self.ref_pic_set_lt_foll)
            .flatten()
            .copied()
            .collect::<Vec<_>>();
        let short_term = self
            .ref_pic_set_st_curr_before
            .iter()
            .chain(&self.ref_pic_set_st_curr_after)
            .chain(&self.ref_pic_set_st_foll)
            .flatten()
            .copied()
            .collect::<Vec<_>>();

        for handle in dpb.handles().collect::<Vec<_>>() {
            if Some(handle) == current {
                continue;
            }

            let reference = if long_term.contains(&handle) {
                Reference::LongTerm
            } else if short_term.contains(&handle) {
                Reference::ShortTerm
            } else {
                Reference::None
            };

            let pic = &mut dpb[handle];
            if pic.reference() != reference {
                pic.set_reference(reference);
            }
        }
    }

    /// The resolved references the current picture predicts from, in the order
    /// StCurrBefore, StCurrAfter, LtCurr.
    pub fn curr_references(&self) -> Vec<PictureHandle> {
        self.ref_pic_set_st_curr_before
            .iter()
            .chain(&self.ref_pic_set_st_curr_after)
            .chain(&self.ref_pic_set_lt_curr)
            .flatten()
            .copied()
            .collect()
    }
}

/// Inserts a stand-in for the lost picture `lost_poc` into `dpb`.
///
/// The samples are copied from the reconstructed picture closest in POC, ignoring pictures with
/// `exclude_poc`. If there is none the stand-in keeps whatever its slot contained.
pub fn synthesize_lost_picture(
    dpb: &mut Dpb,
    lost_poc: i32,
    exclude_poc: i32,
    geometry: Geometry,
    max_dec_pic_buffering: usize,
) -> PictureHandle {
    let source = dpb
        .closest_to_poc(lost_poc, exclude_poc)
        .map(|h| (dpb[h].poc, Rc::clone(dpb[h].frame())));

    let handle = dpb.acquire(geometry, max_dec_pic_buffering);
    let pic = &mut dpb[handle];

    match source {
        Some((source_poc, frame)) => {
            log::warn!(
                "Inserting lost POC {} as a copy of POC {}",
                lost_poc,
                source_poc
            );
            pic.frame_mut().copy_from(&frame);
        }
        None => log::warn!("Inserting lost POC {} with blank samples", lost_poc),
    }

    pic.poc = lost_poc;
    pic.temporal_id = 0;
    pic.synthesized = true;
    pic.reconstructed = true;
    pic.needed_for_output = true;
    pic.set_reference(Reference::ShortTerm);

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::parser::LongTermRefPic;
    use crate::codec::h265::parser::ShortTermRefPicSet;
    use crate::video_frame::ChromaFormat;
    use crate::video_frame::Y_PLANE;
    use crate::Resolution;

    fn geometry() -> Geometry {
        Geometry {
            resolution: Resolution {
                width: 8,
                height: 8,
            },
            max_cu_size: 16,
            chroma_format: ChromaFormat::Monochrome,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
        }
    }

    fn sps() -> Sps {
        Sps {
            log2_max_pic_order_cnt_lsb_minus4: 4,
            long_term_ref_pics_present_flag: true,
            ..Default::default()
        }
    }

    fn add_picture(dpb: &mut Dpb, poc: i32, sample: u16) -> PictureHandle {
        let handle = dpb.acquire(geometry(), 6);
        let pic = &mut dpb[handle];
        pic.poc = poc;
        pic.reconstructed = true;
        pic.set_reference(Reference::ShortTerm);
        pic.frame_mut().fill_plane(Y_PLANE, sample);
        handle
    }

    #[test]
    fn derive_splits_lists() {
        let mut st = ShortTermRefPicSet::with_deltas(&[-1, -3], &[2]);
        st.used_by_curr_pic_s0[1] = false;

        let hdr = SliceHeader {
            short_term_ref_pic_set: st,
            long_term_refs: vec![
                LongTermRefPic {
                    poc_lsb_lt: 4,
                    used_by_curr_pic_lt_flag: true,
                    ..Default::default()
                },
                LongTermRefPic {
                    poc_lsb_lt: 2,
                    used_by_curr_pic_lt_flag: false,
                    delta_poc_msb_present_flag: true,
                    delta_poc_msb_cycle_lt: 1,
                },
            ],
            ..Default::default()
        };

        let rps = RefPicSet::derive(&hdr, &sps(), NaluType::TrailR, 260);
        assert_eq!(rps.poc_st_curr_before, vec![259]);
        assert_eq!(rps.poc_st_curr_after, vec![262]);
        assert_eq!(rps.poc_st_foll, vec![257]);
        assert_eq!(
            rps.poc_lt_curr,
            vec![LongTermPoc {
                poc: 4,
                msb_present: false
            }]
        );
        // 260 - 1 * 256 - (260 & 255) + 2
        assert_eq!(rps.poc_lt_foll[0].poc, 2);

        let idr = RefPicSet::derive(&hdr, &sps(), NaluType::IdrWRadl, 0);
        assert_eq!(idr.short_term_pocs().count(), 0);
        assert!(idr.poc_lt_curr.is_empty());
    }

    #[test]
    fn marking_follows_the_set() {
        let mut dpb = Dpb::default();
        let p0 = add_picture(&mut dpb, 0, 0);
        let p4 = add_picture(&mut dpb, 4, 0);
        let p8 = add_picture(&mut dpb, 8, 0);
        let current = add_picture(&mut dpb, 6, 0);

        let hdr = SliceHeader {
            short_term_ref_pic_set: ShortTermRefPicSet::with_deltas(&[-2], &[2]),
            long_term_refs: vec![LongTermRefPic {
                poc_lsb_lt: 0,
                used_by_curr_pic_lt_flag: true,
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut rps = RefPicSet::derive(&hdr, &sps(), NaluType::TrailR, 6);
        rps.resolve_and_mark(&mut dpb, Some(current));

        assert_eq!(dpb[p0].reference(), Reference::LongTerm);
        assert_eq!(dpb[p4].reference(), Reference::ShortTerm);
        assert_eq!(dpb[p8].reference(), Reference::ShortTerm);
        assert_eq!(rps.curr_references(), vec![p4, p8, p0]);

        // A set that no longer mentions POC 0 and 8 releases them.
        let hdr = SliceHeader {
            short_term_ref_pic_set: ShortTermRefPicSet::with_deltas(&[-2], &[]),
            ..Default::default()
        };
        let mut rps = RefPicSet::derive(&hdr, &sps(), NaluType::TrailR, 6);
        rps.resolve_and_mark(&mut dpb, Some(current));

        assert_eq!(dpb[p0].reference(), Reference::None);
        assert_eq!(dpb[p8].reference(), Reference::None);
        assert_eq!(dpb[current].reference(), Reference::ShortTerm);
    }

    #[test]
    fn lost_reference_is_concealed() {
        let mut dpb = Dpb::default();
        add_picture(&mut dpb, 0, 10);
        add_picture(&mut dpb, 8, 80);

        let hdr = SliceHeader {
            short_term_ref_pic_set: ShortTermRefPicSet::with_deltas(&[-2, -6], &[]),
            ..Default::default()
        };
        let rps = RefPicSet::derive(&hdr, &sps(), NaluType::TrailR, 6);

        // POC 4 is missing. POC 0 precedes the anchor and is not.
        assert_eq!(rps.first_lost_reference(&dpb, 0, None), Some(4));
        assert_eq!(rps.first_lost_reference(&dpb, 5, None), None);

        // 0 and 8 are both at distance 4: the lowest POC wins.
        let handle = synthesize_lost_picture(&mut dpb, 4, 6, geometry(), 6);
        let pic = &dpb[handle];
        assert_eq!(pic.poc, 4);
        assert!(pic.synthesized && pic.reconstructed && pic.needed_for_output);
        assert_eq!(pic.reference(), Reference::ShortTerm);
        assert_eq!(pic.frame().sample(Y_PLANE, 3, 3), 10);

        // Once inserted, the reference is not reported again.
        assert_eq!(rps.first_lost_reference(&dpb, 0, None), None);
    }
}
