// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for codec backends.
//!
//! A backend reconstructs the samples of the pictures the decoder hands it. The decoder keeps
//! all the decoding state so that backends only need to deal with the current picture and its
//! references.

pub mod dummy;
