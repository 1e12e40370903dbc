// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ccdec, a simple decoder program driving the H.265 decoder with the dummy backend. Capable of
//! computing MD5 checksums of the output and writing the raw output frames to a file.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use argh::FromArgs;
use bytes::Bytes;

use cros_decoder_core::codec::h265::parser::Nalu;
use cros_decoder_core::decoder::stateless::StatelessDecoder;
use cros_decoder_core::decoder::DecoderConfig;
use cros_decoder_core::decoder::OutputPicture;
use cros_decoder_core::utils::simple_playback_loop;
use cros_decoder_core::utils::NalIterator;

#[derive(Debug)]
enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Simple H.265 player using the dummy backend
#[derive(Debug, FromArgs)]
struct Args {
    /// input file, an H.265 Annex B byte stream
    #[argh(positional)]
    input: PathBuf,

    /// output file to write the decoded frames to
    #[argh(option)]
    output: Option<PathBuf>,

    /// whether to write a frame per file. Requires "output" to be set.
    #[argh(switch)]
    multiple_output_files: bool,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    compute_md5: Option<Md5Computation>,

    /// number of pictures to skip before looking for a random access point. Default: 0
    #[argh(option, default = "0")]
    skip_frames: u32,

    /// do not check pictures against their decoded picture hash SEI
    #[argh(switch)]
    no_hash_check: bool,
}

/// Returns `output` with the frame number inserted before its extension.
fn decide_output_file_name(output: &Path, frame_num: usize) -> PathBuf {
    let extension = output.extension().and_then(|s| s.to_str()).unwrap_or("yuv");
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
    output.with_file_name(format!("{}_{:04}.{}", stem, frame_num, extension))
}

/// Planes of `picture`, one after the other.
fn frame_bytes(picture: &OutputPicture) -> Vec<u8> {
    (0..picture.frame.num_planes())
        .flat_map(|plane| picture.frame.plane(plane).iter().copied())
        .collect()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    if args.multiple_output_files && args.output.is_none() {
        anyhow::bail!("--multiple-output-files requires --output");
    }

    let input = Bytes::from(
        std::fs::read(&args.input)
            .with_context(|| format!("failed to read {}", args.input.display()))?,
    );

    let mut output_file = match (&args.output, args.multiple_output_files) {
        (Some(path), false) => Some(File::create(path)?),
        _ => None,
    };

    let config = DecoderConfig {
        skip_frames: args.skip_frames,
        verify_picture_hash: !args.no_hash_check,
    };
    let mut decoder = StatelessDecoder::new_dummy(config);

    let mut stream_md5 = md5::Context::new();
    let mut frame_num = 0;
    let mut write_error = None;

    let mut on_new_frame = |picture: OutputPicture| {
        let data = frame_bytes(&picture);
        let crc = crc32fast::hash(&data);
        let geometry = picture.frame.geometry();
        log::info!(
            "POC {} ({}, crc32 {:08x}){}{}",
            picture.poc,
            geometry.resolution,
            crc,
            if picture.field_pic { " field" } else { "" },
            if picture.synthesized { " concealed" } else { "" },
        );

        match args.compute_md5 {
            Some(Md5Computation::Frame) => println!("{:x}", md5::compute(&data)),
            Some(Md5Computation::Stream) => stream_md5.consume(&data),
            None => (),
        }

        let result = match (&args.output, &mut output_file) {
            (_, Some(file)) => file.write_all(&data),
            (Some(path), None) => File::create(decide_output_file_name(path, frame_num))
                .and_then(|mut file| file.write_all(&data)),
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            write_error.get_or_insert(e);
        }

        frame_num += 1;
    };

    simple_playback_loop(
        &mut decoder,
        NalIterator::<Nalu>::new(&input),
        &mut on_new_frame,
    )?;

    if let Some(e) = write_error {
        return Err(e).context("failed to write output frames");
    }

    if let Some(Md5Computation::Stream) = args.compute_md5 {
        println!("{:x}", stream_md5.compute());
    }

    log::info!("{:#?}", decoder.stats());

    Ok(())
}
