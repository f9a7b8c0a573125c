use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use crate::convert::yuv::{rgb_to_i420, Yuv420};
use crate::error::ConvertError;

/// Decode one MJPEG frame into planar 4:2:0.
///
/// Odd decoded dimensions are cropped to the nearest even size.
pub fn decode_mjpeg(data: &[u8]) -> Result<Yuv420, ConvertError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| ConvertError::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| ConvertError::Decode("missing frame header".into()))?;

    let (w, h) = (info.width as usize, info.height as usize);
    let (ew, eh) = (w & !1, h & !1);

    match info.pixel_format {
        JpegPixelFormat::RGB24 => {
            if (ew, eh) == (w, h) {
                return rgb_to_i420(&pixels, w as u32, h as u32);
            }
            let mut cropped = Vec::with_capacity(ew * eh * 3);
            for row in pixels.chunks_exact(w * 3).take(eh) {
                cropped.extend_from_slice(&row[..ew * 3]);
            }
            rgb_to_i420(&cropped, ew as u32, eh as u32)
        }
        JpegPixelFormat::L8 => {
            let mut img = Yuv420::new(ew as u32, eh as u32)?;
            for (y, row) in pixels.chunks_exact(w).take(eh).enumerate() {
                img.y[y * ew..(y + 1) * ew].copy_from_slice(&row[..ew]);
            }
            Ok(img)
        }
        other => Err(ConvertError::Decode(format!(
            "unsupported JPEG pixel format {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    #[test]
    fn test_decode_mjpeg_gray_frame() {
        let rgb = vec![128u8; 16 * 8 * 3];
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 95)
            .encode(&rgb, 16, 8, ExtendedColorType::Rgb8)
            .unwrap();

        let img = decode_mjpeg(&jpeg).unwrap();
        assert_eq!((img.width, img.height), (16, 8));
        assert!(img.y.iter().all(|&y| (y as i32 - 128).abs() <= 3));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_mjpeg(&[0x00, 0x01, 0x02]),
            Err(ConvertError::Decode(_))
        ));
    }
}
