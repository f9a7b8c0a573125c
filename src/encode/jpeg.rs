use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};

use crate::capture::frame::{ImageData, PixelFormat, StreamBuffer};
use crate::convert::yuv::{i420_to_rgb, nv21_to_i420, yuyv_to_i420, yv12_to_i420};
use crate::error::{ConvertError, EncodeError};

/// Still-image compressor
pub trait StillCodec: Send {
    /// Compress tightly packed RGB24 into a complete image stream
    fn encode(&mut self, rgb: &[u8], width: u32, height: u32, quality: u8)
        -> Result<Vec<u8>, EncodeError>;
}

/// Baseline JPEG through the `image` encoder
#[derive(Debug, Default)]
pub struct JpegCodec;

impl StillCodec for JpegCodec {
    fn encode(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(rgb.len() / 6);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            rgb,
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// Tightly packed RGB24 view of an encoder source buffer
pub fn source_rgb(source: &StreamBuffer) -> Result<Vec<u8>, EncodeError> {
    let (w, h, stride) = (source.width, source.height, source.stride);
    let rgb = match &source.data {
        ImageData::Rgb24(data) => {
            let (row, pitch) = (w as usize * 3, stride as usize * 3);
            if stride == w {
                data.get(..row * h as usize)
                    .ok_or(ConvertError::ShortFrame {
                        expected: row * h as usize,
                        actual: data.len(),
                    })?
                    .to_vec()
            } else {
                let mut out = Vec::with_capacity(row * h as usize);
                for line in data.chunks(pitch).take(h as usize) {
                    out.extend_from_slice(line.get(..row).ok_or(ConvertError::ShortFrame {
                        expected: row,
                        actual: line.len(),
                    })?);
                }
                out
            }
        }
        ImageData::Yuyv(data) => i420_to_rgb(&yuyv_to_i420(data, w, h, stride)?),
        ImageData::Nv21(data) => i420_to_rgb(&nv21_to_i420(data, w, h, stride)?),
        ImageData::Yv12(data) => i420_to_rgb(&yv12_to_i420(data, w, h, stride)?),
        ImageData::Blob(_) => {
            return Err(ConvertError::Unsupported {
                from: PixelFormat::Blob,
                to: PixelFormat::Rgb24,
            }
            .into())
        }
    };
    Ok(rgb)
}

/// Downscale for an embedded thumbnail
pub fn thumbnail(rgb: Vec<u8>, width: u32, height: u32, target: (u32, u32)) -> Option<RgbImage> {
    let image = RgbImage::from_raw(width, height, rgb)?;
    Some(imageops::thumbnail(&image, target.0, target.1))
}
