// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! No residual is decoded: every picture is painted with a pattern that only depends on its
//! POC, which makes concealed and duplicated pictures easy to spot.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::video_frame::VideoFrame;

/// Dummy backend that counts what it is asked to do.
#[derive(Debug, Default)]
pub struct Backend {
    pub num_sequences: usize,
    pub num_pictures: usize,
    pub num_slices: usize,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }
}

/// Paints `frame` with the pattern of the picture with `poc`. Each row of each plane gets its
/// own value.
pub fn paint_frame(frame: &mut VideoFrame, poc: i32) {
    let geometry = *frame.geometry();

    for plane in 0..frame.num_planes() {
        let max_value = (1i64 << geometry.bit_depth(plane)) - 1;
        let stride = geometry.stride(plane);
        let bytes_per_sample = geometry.bytes_per_sample(plane);

        for (y, row) in frame.plane_mut(plane).chunks_exact_mut(stride).enumerate() {
            let value =
                (i64::from(poc) * 8 + plane as i64 * 50 + y as i64).rem_euclid(max_value + 1);

            if bytes_per_sample == 2 {
                for sample in row.chunks_exact_mut(2) {
                    LittleEndian::write_u16(sample, value as u16);
                }
            } else {
                row.fill(value as u8);
            }
        }
    }
}
