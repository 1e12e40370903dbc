// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sample storage for decoded pictures.
//!
//! A `VideoFrame` owns one buffer per color plane. Samples wider than 8 bits are stored as
//! little-endian 16-bit words.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use enumn::N;

use crate::Resolution;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl ChromaFormat {
    pub fn num_planes(&self) -> usize {
        match self {
            ChromaFormat::Monochrome => 1,
            _ => 3,
        }
    }

    /// Horizontal and vertical subsampling shifts of the chroma planes.
    pub fn subsampling(&self) -> (u32, u32) {
        match self {
            ChromaFormat::Monochrome | ChromaFormat::Yuv444 => (0, 0),
            ChromaFormat::Yuv420 => (1, 1),
            ChromaFormat::Yuv422 => (1, 0),
        }
    }
}

/// Everything that determines the allocation of a picture's sample buffers. Two pictures
/// with the same geometry can exchange their samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub resolution: Resolution,
    /// Size of the largest coding unit, i.e. the CTB size.
    pub max_cu_size: u32,
    pub chroma_format: ChromaFormat,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
}

impl Geometry {
    /// Whether every field required to allocate a frame is present.
    pub fn is_valid(&self) -> bool {
        self.resolution.width > 0
            && self.resolution.height > 0
            && self.max_cu_size > 0
            && self.bit_depth_luma >= 8
            && self.bit_depth_chroma >= 8
    }

    pub fn num_planes(&self) -> usize {
        self.chroma_format.num_planes()
    }

    pub fn plane_resolution(&self, plane: usize) -> Resolution {
        if plane == Y_PLANE {
            return self.resolution;
        }

        let (shift_x, shift_y) = self.chroma_format.subsampling();
        Resolution {
            width: (self.resolution.width + (1 << shift_x) - 1) >> shift_x,
            height: (self.resolution.height + (1 << shift_y) - 1) >> shift_y,
        }
    }

    pub fn bit_depth(&self, plane: usize) -> u8 {
        if plane == Y_PLANE {
            self.bit_depth_luma
        } else {
            self.bit_depth_chroma
        }
    }

    pub fn bytes_per_sample(&self, plane: usize) -> usize {
        if self.bit_depth(plane) > 8 {
            2
        } else {
            1
        }
    }

    pub fn stride(&self, plane: usize) -> usize {
        self.plane_resolution(plane).width as usize * self.bytes_per_sample(plane)
    }

    pub fn plane_size(&self, plane: usize) -> usize {
        self.stride(plane) * self.plane_resolution(plane).height as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoFrame {
    geometry: Geometry,
    planes: Vec<Vec<u8>>,
}

impl VideoFrame {
    /// Allocates a zeroed frame for `geometry`.
    pub fn new(geometry: Geometry) -> Self {
        let planes = (0..geometry.num_planes())
            .map(|plane| vec![0u8; geometry.plane_size(plane)])
            .collect();

        Self { geometry, planes }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        &self.planes[plane]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        &mut self.planes[plane]
    }

    /// Returns the sample at (`x`, `y`) of `plane`.
    pub fn sample(&self, plane: usize, x: usize, y: usize) -> u16 {
        let bps = self.geometry.bytes_per_sample(plane);
        let offset = y * self.geometry.stride(plane) + x * bps;
        let data = &self.planes[plane];

        if bps == 2 {
            LittleEndian::read_u16(&data[offset..offset + 2])
        } else {
            u16::from(data[offset])
        }
    }

    /// Sets every sample of `plane` to `value`.
    pub fn fill_plane(&mut self, plane: usize, value: u16) {
        let data = &mut self.planes[plane];

        if self.geometry.bytes_per_sample(plane) == 2 {
            for sample in data.chunks_exact_mut(2) {
                LittleEndian::write_u16(sample, value);
            }
        } else {
            data.fill(value as u8);
        }
    }

    /// Copies the samples of `other` into this frame. Frames of a different geometry only
    /// have their overlapping area copied.
    pub fn copy_from(&mut self, other: &VideoFrame) {
        if self.geometry == other.geometry {
            self.planes.clone_from(&other.planes);
            return;
        }

        for plane in 0..self.num_planes().min(other.num_planes()) {
            if self.geometry.bytes_per_sample(plane) != other.geometry.bytes_per_sample(plane) {
                continue;
            }

            let dst_stride = self.geometry.stride(plane);
            let src_stride = other.geometry.stride(plane);
            let row_len = dst_stride.min(src_stride);
            let rows = self
                .geometry
                .plane_resolution(plane)
                .height
                .min(other.geometry.plane_resolution(plane).height) as usize;

            for row in 0..rows {
                let dst = &mut self.planes[plane][row * dst_stride..][..row_len];
                dst.copy_from_slice(&other.planes[plane][row * src_stride..][..row_len]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(width: u32, height: u32, bit_depth: u8) -> Geometry {
        Geometry {
            resolution: Resolution { width, height },
            max_cu_size: 16,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: bit_depth,
            bit_depth_chroma: bit_depth,
        }
    }

    #[test]
    fn odd_sizes_round_chroma_up() {
        let geometry = geometry(17, 9, 8);
        assert_eq!(
            geometry.plane_resolution(U_PLANE),
            Resolution {
                width: 9,
                height: 5
            }
        );
        assert_eq!(geometry.plane_size(Y_PLANE), 17 * 9);
    }

    #[test]
    fn high_bit_depth_samples_are_little_endian() {
        let mut frame = VideoFrame::new(geometry(4, 4, 10));
        frame.fill_plane(Y_PLANE, 0x3ff);

        assert_eq!(frame.plane(Y_PLANE).len(), 32);
        assert_eq!(&frame.plane(Y_PLANE)[..2], &[0xff, 0x03]);
        assert_eq!(frame.sample(Y_PLANE, 3, 3), 0x3ff);
    }

    #[test]
    fn copy_between_geometries_keeps_overlap() {
        let mut small = VideoFrame::new(geometry(4, 4, 8));
        let mut large = VideoFrame::new(geometry(8, 8, 8));
        large.fill_plane(Y_PLANE, 7);

        small.copy_from(&large);
        assert!(small.plane(Y_PLANE).iter().all(|&s| s == 7));
        assert_eq!(small.geometry().resolution.width, 4);
    }
}
