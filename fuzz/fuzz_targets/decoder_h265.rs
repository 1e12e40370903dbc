// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use cros_decoder_core::codec::h265::parser::Nalu;
use cros_decoder_core::decoder::stateless::StatelessDecoder;
use cros_decoder_core::utils::simple_playback_loop;
use cros_decoder_core::utils::NalIterator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = StatelessDecoder::new_dummy(Default::default());

    let _ = simple_playback_loop(&mut decoder, NalIterator::<Nalu>::new(data), &mut |_| ());
});
