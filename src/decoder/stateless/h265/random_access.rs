// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Entering a stream at an arbitrary point.
//!
//! Decoding can only start at a random access point. Pictures before it are dropped, and so are
//! the leading pictures of the entry CRA or BLA picture that may reference pictures the decoder
//! never saw.

use crate::codec::h265::parser::NaluType;

/// POC from which pictures are known to be decodable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RandomAccessAnchor {
    /// No random access point has been seen yet.
    #[default]
    Unset,
    /// Entered at an IDR picture: nothing needs to be skipped.
    NoSkip,
    /// Entered at a CRA or BLA picture with this POC.
    Poc(i32),
}

impl RandomAccessAnchor {
    /// The anchor as a POC threshold. Pictures with a lower POC may not be decodable.
    pub fn threshold(&self) -> i32 {
        match self {
            RandomAccessAnchor::Unset => i32::MAX,
            RandomAccessAnchor::NoSkip => -i32::MAX,
            RandomAccessAnchor::Poc(poc) => *poc,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, RandomAccessAnchor::Unset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The client asked for this many pictures to be skipped.
    SkipCount,
    /// No random access point has been found yet.
    NotRandomAccessPoint,
    /// A RASL picture of the entry point.
    LeadingPicture,
    /// A RASL picture of a BLA picture.
    BrokenLinkLeading,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipDecision {
    Decode,
    Skip(SkipReason),
}

/// Random access state of a decoding session.
#[derive(Clone, Debug, Default)]
pub struct RandomAccessState {
    anchor: RandomAccessAnchor,
    skip_frames: u32,
    warned_invalid_entry: bool,
    /// Type and POC of the last IRAP picture.
    associated_irap: Option<(NaluType, i32)>,
}

impl RandomAccessState {
    pub fn new(skip_frames: u32) -> Self {
        Self {
            skip_frames,
            ..Default::default()
        }
    }

    pub fn anchor(&self) -> RandomAccessAnchor {
        self.anchor
    }

    pub fn associated_irap(&self) -> Option<(NaluType, i32)> {
        self.associated_irap
    }

    /// Whether the invalid entry point warning has been issued since the last reset.
    pub fn warned_invalid_entry(&self) -> bool {
        self.warned_invalid_entry
    }

    /// Decides whether the picture of type `nalu_type` and POC `poc` must be skipped.
    ///
    /// Skipping a leading picture advances `last_displayed_poc` by one, as the picture would
    /// have been output otherwise.
    pub fn check(
        &mut self,
        nalu_type: NaluType,
        poc: i32,
        last_displayed_poc: &mut i32,
    ) -> SkipDecision {
        if self.skip_frames > 0 {
            self.skip_frames -= 1;
            return SkipDecision::Skip(SkipReason::SkipCount);
        }

        match self.anchor {
            RandomAccessAnchor::Unset => {
                if nalu_type.is_cra() || nalu_type.is_bla() {
                    log::debug!("Random access point at POC {}", poc);
                    self.anchor = RandomAccessAnchor::Poc(poc);
                } else if nalu_type.is_idr() {
                    self.anchor = RandomAccessAnchor::NoSkip;
                } else {
                    if !self.warned_invalid_entry {
                        log::warn!(
                            "{:?} is not a valid random access point, discarding data until the \
                             first IRAP picture",
                            nalu_type
                        );
                        self.warned_invalid_entry = true;
                    }
                    return SkipDecision::Skip(SkipReason::NotRandomAccessPoint);
                }
            }
            anchor if poc < anchor.threshold() && nalu_type.is_rasl() => {
                *last_displayed_poc = last_displayed_poc.saturating_add(1);
                return SkipDecision::Skip(SkipReason::LeadingPicture);
            }
            _ => (),
        }

        match self.associated_irap {
            Some((irap_type, irap_poc))
                if irap_type.is_bla() && poc < irap_poc && nalu_type.is_rasl() =>
            {
                *last_displayed_poc = last_displayed_poc.saturating_add(1);
                SkipDecision::Skip(SkipReason::BrokenLinkLeading)
            }
            _ => SkipDecision::Decode,
        }
    }

    /// Sets the anchor to `poc` if no random access point has been seen yet.
    pub fn set_anchor_if_unset(&mut self, poc: i32) {
        if !self.anchor.is_set() {
            self.anchor = RandomAccessAnchor::Poc(poc);
        }
    }

    /// Checks the references of a picture against the last IRAP picture, then records the
    /// picture if it is an IRAP itself.
    ///
    /// Trailing pictures may not reference anything preceding their IRAP picture in output
    /// order. Offending references are only reported.
    pub fn check_irap_references(
        &mut self,
        nalu_type: NaluType,
        poc: i32,
        reference_pocs: impl IntoIterator<Item = i32>,
    ) {
        if let Some((_, irap_poc)) = self.associated_irap {
            if poc > irap_poc {
                for ref_poc in reference_pocs.into_iter().filter(|&r| r < irap_poc) {
                    log::warn!(
                        "POC {} references POC {}, which precedes its IRAP picture (POC {})",
                        poc,
                        ref_poc,
                        irap_poc
                    );
                }
            }
        }

        if nalu_type.is_irap() {
            self.associated_irap = Some((nalu_type, poc));
        }
    }

    /// Forgets everything about the current coded video sequence. Called at the end of a
    /// sequence. The skip count is left untouched.
    pub fn reset(&mut self) {
        self.anchor = RandomAccessAnchor::Unset;
        self.associated_irap = None;
        self.warned_invalid_entry = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_count_comes_first() {
        let mut state = RandomAccessState::new(2);
        let mut last = -i32::MAX;

        assert_eq!(
            state.check(NaluType::IdrNLp, 0, &mut last),
            SkipDecision::Skip(SkipReason::SkipCount)
        );
        assert_eq!(
            state.check(NaluType::TrailR, 1, &mut last),
            SkipDecision::Skip(SkipReason::SkipCount)
        );
        assert_eq!(state.anchor(), RandomAccessAnchor::Unset);

        assert_eq!(
            state.check(NaluType::IdrWRadl, 0, &mut last),
            SkipDecision::Decode
        );
        assert_eq!(state.anchor(), RandomAccessAnchor::NoSkip);
    }

    #[test]
    fn invalid_entry_warns_once() {
        let mut state = RandomAccessState::new(0);
        let mut last = -i32::MAX;

        for poc in 1..4 {
            assert_eq!(
                state.check(NaluType::TrailR, poc, &mut last),
                SkipDecision::Skip(SkipReason::NotRandomAccessPoint)
            );
            assert!(state.warned_invalid_entry());
        }

        assert_eq!(state.check(NaluType::CraNut, 8, &mut last), SkipDecision::Decode);
        assert_eq!(state.anchor(), RandomAccessAnchor::Poc(8));
        assert_eq!(last, -i32::MAX);

        state.reset();
        assert!(!state.warned_invalid_entry());
    }

    #[test]
    fn leading_pictures_of_entry_cra() {
        let mut state = RandomAccessState::new(0);
        let mut last = -i32::MAX;

        assert_eq!(state.check(NaluType::CraNut, 16, &mut last), SkipDecision::Decode);
        assert_eq!(
            state.check(NaluType::RaslN, 14, &mut last),
            SkipDecision::Skip(SkipReason::LeadingPicture)
        );
        assert_eq!(last, -i32::MAX + 1);

        // Decodable leading pictures and pictures at or after the anchor are kept.
        assert_eq!(state.check(NaluType::RadlN, 15, &mut last), SkipDecision::Decode);
        assert_eq!(state.check(NaluType::RaslR, 16, &mut last), SkipDecision::Decode);
        assert_eq!(state.check(NaluType::TrailR, 20, &mut last), SkipDecision::Decode);
    }

    #[test]
    fn leading_pictures_of_bla() {
        let mut state = RandomAccessState::new(0);
        let mut last = 0;

        assert_eq!(state.check(NaluType::IdrNLp, 0, &mut last), SkipDecision::Decode);
        state.check_irap_references(NaluType::IdrNLp, 0, []);

        assert_eq!(state.check(NaluType::BlaWLp, 32, &mut last), SkipDecision::Decode);
        state.check_irap_references(NaluType::BlaWLp, 32, []);
        assert_eq!(state.associated_irap(), Some((NaluType::BlaWLp, 32)));

        assert_eq!(
            state.check(NaluType::RaslN, 30, &mut last),
            SkipDecision::Skip(SkipReason::BrokenLinkLeading)
        );
        assert_eq!(last, 1);
        assert_eq!(state.check(NaluType::RadlN, 31, &mut last), SkipDecision::Decode);
    }

    #[test]
    fn anchor_thresholds() {
        assert_eq!(RandomAccessAnchor::Unset.threshold(), i32::MAX);
        assert_eq!(RandomAccessAnchor::NoSkip.threshold(), -i32::MAX);
        assert_eq!(RandomAccessAnchor::Poc(-3).threshold(), -3);

        let mut state = RandomAccessState::new(0);
        state.set_anchor_if_unset(5);
        state.set_anchor_if_unset(9);
        assert_eq!(state.anchor(), RandomAccessAnchor::Poc(5));
    }
}
