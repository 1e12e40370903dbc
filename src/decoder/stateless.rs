// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The decoders themselves do
//! hold the decoding state so the backend doesn't need to.
//!
//! The [`StatelessDecoder`] struct is created by combining the codec state with a
//! [backend](crate::backend), after which NAL units can be submitted through the
//! [`StatelessDecoder::decode`] method.

pub mod h265;

use thiserror::Error;

use crate::codec::h265::param_sets::NotPresent;
use crate::codec::h265::param_sets::ParameterSetKind;
use crate::decoder::stateless::h265::H265DecoderState;
use crate::decoder::stateless::h265::StatelessH265DecoderBackend;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderStats;
use crate::decoder::OutputPicture;
use crate::decoder::ReadyFramesQueue;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Error returned by the [`StatelessDecoder::decode`] method.
///
/// All of these are fatal: the decoder tears itself down before returning them and rejects any
/// further input with [`DecodeError::Aborted`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing parameter set: {0}")]
    MissingParameterSet(NotPresent),
    #[error("{kind} {id} changed while a picture using it was being decoded")]
    ParameterSetChanged { kind: ParameterSetKind, id: u8 },
    #[error("invalid stream geometry: {0}")]
    InvalidGeometry(String),
    #[error("malformed NAL unit: {0:#}")]
    MalformedNalu(anyhow::Error),
    #[error(transparent)]
    BackendError(#[from] StatelessBackendError),
    #[error("the decoder has been torn down")]
    Aborted,
}

impl From<NotPresent> for DecodeError {
    fn from(e: NotPresent) -> Self {
        DecodeError::MissingParameterSet(e)
    }
}

/// Parser errors caused by a reference to an unknown parameter set keep their meaning.
impl From<anyhow::Error> for DecodeError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<NotPresent>() {
            Ok(not_present) => DecodeError::MissingParameterSet(not_present),
            Err(e) => DecodeError::MalformedNalu(e),
        }
    }
}

/// Decoder implementations can use this enum to represent their decoding state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum DecodingState {
    /// No sequence has been activated yet.
    #[default]
    AwaitingStreamInfo,
    /// Decoder is currently decoding input.
    Decoding,
    /// A fatal error occurred or the client tore the decoder down.
    Aborted,
}

/// A decoding session.
///
/// This struct manages the high-level decoder state, the decoding statistics and the queue of
/// decoded frames. All the rest is left to codec-specific code.
pub struct StatelessDecoder<B: StatelessH265DecoderBackend> {
    config: DecoderConfig,

    stats: DecoderStats,

    ready_queue: ReadyFramesQueue<OutputPicture>,

    decoding_state: DecodingState,

    /// The backend reconstructing the samples of pictures.
    backend: B,

    /// Codec-specific state.
    codec: H265DecoderState,
}

impl<B: StatelessH265DecoderBackend> StatelessDecoder<B> {
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        let codec = H265DecoderState::new(&config);

        Self {
            config,
            stats: Default::default(),
            ready_queue: Default::default(),
            decoding_state: Default::default(),
            backend,
            codec,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Whether the decoder has been torn down and will refuse further input.
    pub fn is_aborted(&self) -> bool {
        self.decoding_state == DecodingState::Aborted
    }

    /// Returns the next picture ready for output, if any.
    ///
    /// Pictures are queued here as well as returned by [`StatelessDecoder::finish_picture`] and
    /// [`StatelessDecoder::flush`], for clients that prefer polling.
    pub fn next_output(&mut self) -> Option<OutputPicture> {
        (&mut self.ready_queue).next()
    }

    /// Number of pictures waiting in the ready queue.
    pub fn num_ready_frames(&self) -> usize {
        self.ready_queue.len()
    }
}
