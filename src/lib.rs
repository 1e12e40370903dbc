// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control plane of an H.265 decoder.
//!
//! This crate parses H.265 Annex B streams and tracks everything needed to decode them: the
//! parameter sets, the picture order count, the reference picture sets, the decoded picture
//! buffer and the order in which pictures are output. Sample reconstruction is left to a
//! [backend](crate::backend).
//!
//! The [decoder](crate::decoder) module is the entry point. The [codec](crate::codec) module
//! contains the syntax-level building blocks it relies on.

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod utils;
pub mod video_frame;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
