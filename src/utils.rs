// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

pub mod nalu;

pub use crate::bitstream_utils::NalIterator;

use crate::codec::h265::parser::Nalu;
use crate::decoder::stateless::h265::StatelessH265DecoderBackend;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::DecodeStatus;
use crate::decoder::OutputPicture;

/// Simple decoding loop that plays the stream once from start to finish.
///
/// Every output picture is passed to `on_new_frame` in output order, including those released
/// by the final flush.
pub fn simple_playback_loop<'a, B, I>(
    decoder: &mut StatelessDecoder<B>,
    stream_iter: I,
    on_new_frame: &mut dyn FnMut(OutputPicture),
) -> Result<(), DecodeError>
where
    B: StatelessH265DecoderBackend,
    I: Iterator<Item = Nalu<'a>>,
{
    // Closure that drains all the pictures ready for output.
    let mut check_output = |decoder: &mut StatelessDecoder<B>| {
        while let Some(picture) = decoder.next_output() {
            on_new_frame(picture);
        }
    };

    for nalu in stream_iter {
        // A unit that starts a new picture is submitted again once the previous one is done.
        while decoder.decode(&nalu)? == DecodeStatus::NewPicture {
            decoder.finish_picture()?;
            check_output(decoder);
        }
        check_output(decoder);
    }

    decoder.flush()?;
    check_output(decoder);

    Ok(())
}
