// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.

use crate::backend::dummy::paint_frame;
use crate::backend::dummy::Backend;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::picture::Picture;
use crate::codec::h265::picture::SliceSegment;
use crate::decoder::stateless::h265::StatelessH265DecoderBackend;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::DecoderConfig;

impl StatelessH265DecoderBackend for Backend {
    fn new_sequence(&mut self, sps: &Sps) -> StatelessBackendResult<()> {
        log::debug!(
            "New sequence: {}x{}",
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples
        );
        self.num_sequences += 1;
        Ok(())
    }

    fn begin_picture(&mut self, _: &mut Picture, _: &Sps, _: &Pps) -> StatelessBackendResult<()> {
        self.num_pictures += 1;
        Ok(())
    }

    fn decode_slice(
        &mut self,
        picture: &mut Picture,
        _: &[&Picture],
        _: &SliceSegment,
        _: &[u8],
    ) -> StatelessBackendResult<()> {
        let poc = picture.poc;
        paint_frame(picture.frame_mut(), poc);
        self.num_slices += 1;
        Ok(())
    }

    fn finish_picture(&mut self, _: &mut Picture) -> StatelessBackendResult<()> {
        Ok(())
    }
}

impl StatelessDecoder<Backend> {
    // Creates a new instance of the decoder using the dummy backend.
    pub fn new_dummy(config: DecoderConfig) -> Self {
        Self::new(Backend::new(), config)
    }
}
