// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoded stream decoding.
//!
//! A decoder turns NAL units into [`OutputPicture`]s in display order. The decoding state lives
//! in the decoder, while the reconstruction of samples is delegated to a backend. See the
//! [`stateless`] module for the decoder itself.

pub mod stateless;

use std::collections::VecDeque;
use std::rc::Rc;

use crate::codec::h265::dpb::PictureHandle;
use crate::codec::h265::picture::Picture;
use crate::video_frame::VideoFrame;

/// A picture leaving the decoder, in output order.
#[derive(Clone, Debug)]
pub struct OutputPicture {
    pub poc: i32,
    pub temporal_id: u8,
    /// Sample data. Shared with the DPB slot until the slot is reused.
    pub frame: Rc<VideoFrame>,
    pub field_pic: bool,
    pub top_field: bool,
    /// Set if the picture was never in the stream and has been concealed from a neighbour.
    pub synthesized: bool,
}

impl From<&Picture> for OutputPicture {
    fn from(pic: &Picture) -> Self {
        Self {
            poc: pic.poc,
            temporal_id: pic.temporal_id,
            frame: Rc::clone(pic.frame()),
            field_pic: pic.field_pic,
            top_field: pic.top_field,
            synthesized: pic.synthesized,
        }
    }
}

/// Result of submitting a NAL unit to the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The unit has been fully processed.
    Consumed,
    /// The unit starts a new picture, or ends the sequence, while the previous picture is still
    /// open. Nothing has been consumed: the caller must finish the current picture and submit
    /// the same unit again.
    NewPicture,
}

/// Returned when a picture is finished.
#[derive(Clone, Debug)]
pub struct FinishedPicture {
    pub poc: i32,
    pub handle: PictureHandle,
    /// Pictures that became ready for output as a result, in output order. Pictures drained
    /// by an earlier end of sequence or random access point come first.
    pub output: Vec<OutputPicture>,
}

/// Tunables of a decoding session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Number of pictures to skip at the start of the stream before looking for a random
    /// access point.
    pub skip_frames: u32,
    /// Whether to check finished pictures against their decoded picture hash SEI.
    pub verify_picture_hash: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            skip_frames: 0,
            verify_picture_hash: true,
        }
    }
}

/// Counters of the recoverable events met while decoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub pictures_decoded: u64,
    pub pictures_output: u64,
    /// Pictures dropped by the random access logic.
    pub skipped_pictures: u64,
    /// Times the stream was entered at a picture that is not a random access point. Only
    /// the first of a run of such pictures is counted.
    pub invalid_entry_points: u64,
    /// Missing references replaced by a copy of another picture.
    pub lost_pictures_recovered: u64,
    /// Times the DPB had to grow beyond the buffering declared by the stream.
    pub pool_extensions: u64,
    pub hash_checks: u64,
    pub hash_mismatches: u64,
    /// NAL units ignored because of their type or layer.
    pub discarded_units: u64,
}

/// Queue of pictures ready to be handed out to the client.
pub struct ReadyFramesQueue<T> {
    /// Queue of all the frames waiting to be sent to the client.
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    /// Push `handle` to the back of the queue.
    fn push(&mut self, handle: T) {
        self.queue.push_back(handle)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&mut self) {
        self.queue.clear()
    }
}

impl<T> Extend<T> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it and resetting
/// its display order counter.
impl<T> Iterator for &mut ReadyFramesQueue<T> {
    type Item = T;

    /// Returns the next frame (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_is_fifo() {
        let mut queue = ReadyFramesQueue::default();
        queue.push(1);
        queue.extend([2, 3]);
        assert_eq!(queue.len(), 3);

        assert_eq!((&mut queue).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(queue.is_empty());

        queue.push(4);
        queue.clear();
        assert_eq!((&mut queue).next(), None);
    }
}
