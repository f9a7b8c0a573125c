//! Pixel format conversion library
//!
//! Pure functions plus a per-frame [`FrameConverter`] that decodes one raw
//! device frame at most once and fills any number of destination buffers
//! from it.

pub mod yuv;

use crate::capture::decode::decode_mjpeg;
use crate::capture::frame::{Frame, ImageData, PixelFormat, StreamBuffer};
use crate::error::ConvertError;

pub use yuv::{
    i420_to_nv21, i420_to_nv21_into, i420_to_rgb, i420_to_rgb_into, i420_to_yuyv, i420_to_yuyv_into,
    i420_to_yv12, i420_to_yv12_into, nv21_to_i420, rgb_to_i420, rotate_rgb, scale_i420,
    yuyv_to_i420, yuyv_to_nv21, yuyv_to_yv12, yv12_to_i420, Yuv420,
};

/// Decode any source frame into planar 4:2:0
pub fn frame_to_i420(frame: &Frame) -> Result<Yuv420, ConvertError> {
    let meta = &frame.meta;
    let data = &frame.data[..];
    match meta.format {
        PixelFormat::Yuyv => yuyv_to_i420(data, meta.width, meta.height, meta.stride),
        PixelFormat::Nv21 => nv21_to_i420(data, meta.width, meta.height, meta.stride),
        PixelFormat::Yv12 => yv12_to_i420(data, meta.width, meta.height, meta.stride),
        PixelFormat::Rgb24 => rgb_to_i420(data, meta.width, meta.height),
        PixelFormat::Mjpeg => decode_mjpeg(data),
        PixelFormat::Blob => Err(ConvertError::Unsupported {
            from: PixelFormat::Blob,
            to: PixelFormat::Yv12,
        }),
    }
}

/// Write a planar image into a destination buffer, resizing when the
/// geometry differs
pub fn write_i420(img: &Yuv420, dst: &mut StreamBuffer) -> Result<(), ConvertError> {
    let scaled;
    let src = if img.width != dst.width || img.height != dst.height {
        scaled = scale_i420(img, dst.width, dst.height)?;
        &scaled
    } else {
        img
    };
    let stride = dst.stride;
    match &mut dst.data {
        ImageData::Yuyv(d) => i420_to_yuyv_into(src, d, stride),
        ImageData::Nv21(d) => i420_to_nv21_into(src, d, stride),
        ImageData::Yv12(d) => i420_to_yv12_into(src, d, stride),
        ImageData::Rgb24(d) => i420_to_rgb_into(src, d, stride),
        ImageData::Blob(_) => Err(ConvertError::Unsupported {
            from: PixelFormat::Yv12,
            to: PixelFormat::Blob,
        }),
    }
}

/// Row copy between two buffers of the same layout and geometry but
/// possibly different strides
fn copy_same_layout(frame: &Frame, dst: &mut StreamBuffer) -> Result<(), ConvertError> {
    let meta = &frame.meta;
    let (h, src_stride, dst_stride) = (meta.height as usize, meta.stride as usize, dst.stride as usize);
    let width = meta.width as usize;

    // (src offset, dst offset, rows, row bytes, src stride, dst stride) in bytes
    let planes: Vec<(usize, usize, usize, usize, usize, usize)> = match meta.format {
        PixelFormat::Yuyv => vec![(0, 0, h, width * 2, src_stride * 2, dst_stride * 2)],
        PixelFormat::Rgb24 => vec![(0, 0, h, width * 3, src_stride * 3, dst_stride * 3)],
        PixelFormat::Nv21 => vec![
            (0, 0, h, width, src_stride, dst_stride),
            (src_stride * h, dst_stride * h, h / 2, width, src_stride, dst_stride),
        ],
        PixelFormat::Yv12 => {
            let (scs, dcs) = (
                crate::capture::frame::yv12_chroma_stride(src_stride),
                crate::capture::frame::yv12_chroma_stride(dst_stride),
            );
            let (sv, dv) = (src_stride * h, dst_stride * h);
            let (su, du) = (sv + scs * (h / 2), dv + dcs * (h / 2));
            vec![
                (0, 0, h, width, src_stride, dst_stride),
                (sv, dv, h / 2, width / 2, scs, dcs),
                (su, du, h / 2, width / 2, scs, dcs),
            ]
        }
        PixelFormat::Mjpeg | PixelFormat::Blob => {
            return Err(ConvertError::Unsupported {
                from: meta.format,
                to: dst.format(),
            })
        }
    };

    let src = &frame.data[..];
    let out = dst.data.as_mut_slice();
    for (src_off, dst_off, rows, row_bytes, ss, ds) in planes {
        let src_end = src_off + ss * (rows - 1) + row_bytes;
        if src.len() < src_end {
            return Err(ConvertError::ShortFrame {
                expected: src_end,
                actual: src.len(),
            });
        }
        let dst_end = dst_off + ds * (rows - 1) + row_bytes;
        if out.len() < dst_end {
            return Err(ConvertError::ShortFrame {
                expected: dst_end,
                actual: out.len(),
            });
        }
        for row in 0..rows {
            out[dst_off + row * ds..dst_off + row * ds + row_bytes]
                .copy_from_slice(&src[src_off + row * ss..src_off + row * ss + row_bytes]);
        }
    }
    Ok(())
}

/// Fills destination buffers from one raw frame, decoding it at most once
pub struct FrameConverter<'a> {
    frame: &'a Frame,
    planar: Option<Yuv420>,
}

impl<'a> FrameConverter<'a> {
    pub fn new(frame: &'a Frame) -> Self {
        Self {
            frame,
            planar: None,
        }
    }

    /// Reuse a planar decode made while validating the frame
    pub fn with_planar(frame: &'a Frame, planar: Yuv420) -> Self {
        Self {
            frame,
            planar: Some(planar),
        }
    }

    /// Planar view of the frame, decoded on first use
    pub fn planar(&mut self) -> Result<&Yuv420, ConvertError> {
        let planar = match self.planar.take() {
            Some(planar) => planar,
            None => frame_to_i420(self.frame)?,
        };
        Ok(self.planar.insert(planar))
    }

    /// Convert the frame into `dst`, dispatching on the destination layout
    pub fn fill(&mut self, dst: &mut StreamBuffer) -> Result<(), ConvertError> {
        let meta = &self.frame.meta;
        let same_geometry = meta.width == dst.width && meta.height == dst.height;
        if same_geometry && meta.format == dst.format() && !meta.format.is_compressed() {
            return copy_same_layout(self.frame, dst);
        }
        if dst.is_still() {
            return Err(ConvertError::Unsupported {
                from: meta.format,
                to: PixelFormat::Blob,
            });
        }
        write_i420(self.planar()?, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    fn yuyv_frame(width: u32, height: u32) -> Frame {
        let mut img = Yuv420::new(width, height).unwrap();
        for (i, px) in img.y.iter_mut().enumerate() {
            *px = (i % 200) as u8 + 16;
        }
        Frame {
            data: Bytes::from(i420_to_yuyv(&img)),
            meta: Arc::new(FrameMetadata {
                sequence: 1,
                width,
                height,
                stride: width,
                format: PixelFormat::Yuyv,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_fill_same_format_copies() {
        let frame = yuyv_frame(8, 4);
        let mut dst = StreamBuffer::yuyv(1, 8, 4).unwrap().with_stride(16);
        FrameConverter::new(&frame).fill(&mut dst).unwrap();
        assert_eq!(&dst.data.as_slice()[..16], &frame.data[..16]);
        assert_eq!(&dst.data.as_slice()[32..48], &frame.data[16..32]);
    }

    #[test]
    fn test_fill_every_destination_from_one_frame() {
        let frame = yuyv_frame(16, 8);
        let mut conv = FrameConverter::new(&frame);
        let luma: Vec<u8> = frame.data.iter().step_by(2).copied().collect();

        let mut nv21 = StreamBuffer::nv21(1, 16, 8).unwrap();
        conv.fill(&mut nv21).unwrap();
        assert_eq!(&nv21.data.as_slice()[..128], &luma[..]);

        let mut yv12 = StreamBuffer::yv12(2, 16, 8).unwrap();
        conv.fill(&mut yv12).unwrap();
        assert_eq!(&yv12.data.as_slice()[..128], &luma[..]);

        let mut small = StreamBuffer::nv21(3, 8, 4).unwrap();
        conv.fill(&mut small).unwrap();
        assert_eq!(small.data.as_slice()[0], luma[0]);

        let mut rgb = StreamBuffer::rgb(0, 16, 8).unwrap();
        conv.fill(&mut rgb).unwrap();
        assert!(rgb.data.as_slice().iter().any(|&c| c != 0));
    }

    #[test]
    fn test_fill_rejects_still_destination() {
        let frame = yuyv_frame(8, 4);
        let mut blob = StreamBuffer::blob(1, 8, 4, 1024).unwrap();
        assert!(FrameConverter::new(&frame).fill(&mut blob).is_err());
    }

    #[test]
    fn test_short_frame_detected() {
        let mut frame = yuyv_frame(8, 4);
        frame.data = frame.data.slice(..10);
        let mut dst = StreamBuffer::yuyv(1, 8, 4).unwrap();
        assert!(matches!(
            FrameConverter::new(&frame).fill(&mut dst),
            Err(ConvertError::ShortFrame { .. })
        ));
    }
}
