//! YUV and RGB plane conversions
//!
//! All 4:2:0 and 4:2:2 routines require even dimensions; the canonical
//! intermediate is [`Yuv420`] (I420 plane order, tightly packed).
//! Chroma subsampling averages vertically adjacent samples with rounding,
//! matching what most V4L2 drivers do for YUYV -> NV21.

use crate::capture::frame::yv12_chroma_stride;
use crate::error::ConvertError;

/// Planar 4:2:0 image with tightly packed Y, U and V planes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Yuv420 {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl Yuv420 {
    /// Black image (luma 0, neutral chroma)
    pub fn new(width: u32, height: u32) -> Result<Self, ConvertError> {
        check_even(width, height)?;
        let (w, h) = (width as usize, height as usize);
        Ok(Self {
            width,
            height,
            y: vec![0; w * h],
            u: vec![128; w * h / 4],
            v: vec![128; w * h / 4],
        })
    }

    pub fn chroma_width(&self) -> usize {
        self.width as usize / 2
    }

    pub fn chroma_height(&self) -> usize {
        self.height as usize / 2
    }
}

pub(crate) fn check_even(width: u32, height: u32) -> Result<(), ConvertError> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(ConvertError::Geometry { width, height });
    }
    Ok(())
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::ShortFrame {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) >> 1) as u8
}

/// Packed YUYV (Y0 U Y1 V) with a byte stride of `stride * 2` into I420
pub fn yuyv_to_i420(src: &[u8], width: u32, height: u32, stride: u32) -> Result<Yuv420, ConvertError> {
    check_even(width, height)?;
    let (w, h, row) = (width as usize, height as usize, stride as usize * 2);
    check_len(src, row * (h - 1) + w * 2)?;

    let mut out = Yuv420::new(width, height)?;
    for y in 0..h {
        let line = &src[y * row..y * row + w * 2];
        let dst = &mut out.y[y * w..(y + 1) * w];
        for (x, px) in dst.iter_mut().enumerate() {
            *px = line[x * 2];
        }
    }

    let cw = w / 2;
    for cy in 0..h / 2 {
        let top = &src[cy * 2 * row..cy * 2 * row + w * 2];
        let bottom = &src[(cy * 2 + 1) * row..(cy * 2 + 1) * row + w * 2];
        for cx in 0..cw {
            out.u[cy * cw + cx] = avg(top[cx * 4 + 1], bottom[cx * 4 + 1]);
            out.v[cy * cw + cx] = avg(top[cx * 4 + 3], bottom[cx * 4 + 3]);
        }
    }
    Ok(out)
}

/// I420 into packed YUYV; each chroma row is shared by two output rows
pub fn i420_to_yuyv_into(img: &Yuv420, dst: &mut [u8], stride: u32) -> Result<(), ConvertError> {
    let (w, h, row) = (img.width as usize, img.height as usize, stride as usize * 2);
    check_len(dst, row * (h - 1) + w * 2)?;
    let cw = img.chroma_width();
    for y in 0..h {
        let luma = &img.y[y * w..(y + 1) * w];
        let u = &img.u[(y / 2) * cw..(y / 2 + 1) * cw];
        let v = &img.v[(y / 2) * cw..(y / 2 + 1) * cw];
        let line = &mut dst[y * row..y * row + w * 2];
        for cx in 0..cw {
            line[cx * 4] = luma[cx * 2];
            line[cx * 4 + 1] = u[cx];
            line[cx * 4 + 2] = luma[cx * 2 + 1];
            line[cx * 4 + 3] = v[cx];
        }
    }
    Ok(())
}

pub fn i420_to_yuyv(img: &Yuv420) -> Vec<u8> {
    let mut out = vec![0; img.width as usize * img.height as usize * 2];
    // Size is exact, cannot fail
    let _ = i420_to_yuyv_into(img, &mut out, img.width);
    out
}

/// NV21 (Y plane, then interleaved V/U rows sharing the luma stride)
pub fn nv21_to_i420(src: &[u8], width: u32, height: u32, stride: u32) -> Result<Yuv420, ConvertError> {
    check_even(width, height)?;
    let (w, h, s) = (width as usize, height as usize, stride as usize);
    check_len(src, s * h + s * (h / 2 - 1) + w)?;

    let mut out = Yuv420::new(width, height)?;
    for y in 0..h {
        out.y[y * w..(y + 1) * w].copy_from_slice(&src[y * s..y * s + w]);
    }
    let cw = w / 2;
    let vu = &src[s * h..];
    for cy in 0..h / 2 {
        let line = &vu[cy * s..cy * s + w];
        for cx in 0..cw {
            out.v[cy * cw + cx] = line[cx * 2];
            out.u[cy * cw + cx] = line[cx * 2 + 1];
        }
    }
    Ok(out)
}

pub fn i420_to_nv21_into(img: &Yuv420, dst: &mut [u8], stride: u32) -> Result<(), ConvertError> {
    let (w, h, s) = (img.width as usize, img.height as usize, stride as usize);
    check_len(dst, s * h + s * (h / 2 - 1) + w)?;
    for y in 0..h {
        dst[y * s..y * s + w].copy_from_slice(&img.y[y * w..(y + 1) * w]);
    }
    let cw = img.chroma_width();
    let (_, vu) = dst.split_at_mut(s * h);
    for cy in 0..h / 2 {
        let line = &mut vu[cy * s..cy * s + w];
        for cx in 0..cw {
            line[cx * 2] = img.v[cy * cw + cx];
            line[cx * 2 + 1] = img.u[cy * cw + cx];
        }
    }
    Ok(())
}

pub fn i420_to_nv21(img: &Yuv420) -> Vec<u8> {
    let mut out = vec![0; img.width as usize * img.height as usize * 3 / 2];
    let _ = i420_to_nv21_into(img, &mut out, img.width);
    out
}

/// YV12: Y plane, then V plane, then U plane; chroma rows are 16-aligned
pub fn yv12_to_i420(src: &[u8], width: u32, height: u32, stride: u32) -> Result<Yuv420, ConvertError> {
    check_even(width, height)?;
    let (w, h, s) = (width as usize, height as usize, stride as usize);
    let cs = yv12_chroma_stride(s);
    let (cw, ch) = (w / 2, h / 2);
    let v_off = s * h;
    let u_off = v_off + cs * ch;
    check_len(src, u_off + cs * (ch - 1) + cw)?;

    let mut out = Yuv420::new(width, height)?;
    for y in 0..h {
        out.y[y * w..(y + 1) * w].copy_from_slice(&src[y * s..y * s + w]);
    }
    for cy in 0..ch {
        out.v[cy * cw..(cy + 1) * cw].copy_from_slice(&src[v_off + cy * cs..v_off + cy * cs + cw]);
        out.u[cy * cw..(cy + 1) * cw].copy_from_slice(&src[u_off + cy * cs..u_off + cy * cs + cw]);
    }
    Ok(out)
}

pub fn i420_to_yv12_into(img: &Yuv420, dst: &mut [u8], stride: u32) -> Result<(), ConvertError> {
    let (w, h, s) = (img.width as usize, img.height as usize, stride as usize);
    let cs = yv12_chroma_stride(s);
    let (cw, ch) = (w / 2, h / 2);
    let v_off = s * h;
    let u_off = v_off + cs * ch;
    check_len(dst, u_off + cs * (ch - 1) + cw)?;
    for y in 0..h {
        dst[y * s..y * s + w].copy_from_slice(&img.y[y * w..(y + 1) * w]);
    }
    for cy in 0..ch {
        dst[v_off + cy * cs..v_off + cy * cs + cw].copy_from_slice(&img.v[cy * cw..(cy + 1) * cw]);
        dst[u_off + cy * cs..u_off + cy * cs + cw].copy_from_slice(&img.u[cy * cw..(cy + 1) * cw]);
    }
    Ok(())
}

pub fn i420_to_yv12(img: &Yuv420) -> Vec<u8> {
    let mut out = vec![0; crate::capture::frame::yv12_size(img.width as usize, img.height as usize)];
    let _ = i420_to_yv12_into(img, &mut out, img.width);
    out
}

/// Packed YUYV straight to NV21
pub fn yuyv_to_nv21(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let planar = yuyv_to_i420(src, width, height, width)?;
    let mut out = vec![0; width as usize * height as usize * 3 / 2];
    i420_to_nv21_into(&planar, &mut out, width)?;
    Ok(out)
}

/// Packed YUYV straight to YV12
pub fn yuyv_to_yv12(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let planar = yuyv_to_i420(src, width, height, width)?;
    let mut out = vec![0; crate::capture::frame::yv12_size(width as usize, height as usize)];
    i420_to_yv12_into(&planar, &mut out, width)?;
    Ok(out)
}

#[inline]
pub(crate) fn rgb_to_yuv(r: i32, g: i32, b: i32) -> (u8, u8, u8) {
    // JFIF full range, 8 fractional bits
    let y = (77 * r + 150 * g + 29 * b + 128) >> 8;
    let u = ((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128;
    let v = ((128 * r - 107 * g - 21 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

#[inline]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8(c + ((359 * e + 128) >> 8)),
        clamp_u8(c - ((88 * d + 183 * e + 128) >> 8)),
        clamp_u8(c + ((454 * d + 128) >> 8)),
    ]
}

/// Tightly packed RGB24 to I420, chroma averaged over each 2x2 block
pub fn rgb_to_i420(rgb: &[u8], width: u32, height: u32) -> Result<Yuv420, ConvertError> {
    check_even(width, height)?;
    let (w, h) = (width as usize, height as usize);
    check_len(rgb, w * h * 3)?;
    let mut out = Yuv420::new(width, height)?;
    let cw = w / 2;
    for cy in 0..h / 2 {
        for cx in 0..cw {
            let (mut su, mut sv) = (0u32, 0u32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let (x, y) = (cx * 2 + dx, cy * 2 + dy);
                let p = &rgb[(y * w + x) * 3..(y * w + x) * 3 + 3];
                let (ly, u, v) = rgb_to_yuv(p[0] as i32, p[1] as i32, p[2] as i32);
                out.y[y * w + x] = ly;
                su += u as u32;
                sv += v as u32;
            }
            out.u[cy * cw + cx] = ((su + 2) / 4) as u8;
            out.v[cy * cw + cx] = ((sv + 2) / 4) as u8;
        }
    }
    Ok(out)
}

/// I420 into RGB24 rows of `stride` pixels
pub fn i420_to_rgb_into(img: &Yuv420, dst: &mut [u8], stride: u32) -> Result<(), ConvertError> {
    let (w, h, row) = (img.width as usize, img.height as usize, stride as usize * 3);
    check_len(dst, row * (h - 1) + w * 3)?;
    let cw = img.chroma_width();
    for y in 0..h {
        let line = &mut dst[y * row..y * row + w * 3];
        for x in 0..w {
            let c = (y / 2) * cw + x / 2;
            let px = yuv_to_rgb(img.y[y * w + x], img.u[c], img.v[c]);
            line[x * 3..x * 3 + 3].copy_from_slice(&px);
        }
    }
    Ok(())
}

pub fn i420_to_rgb(img: &Yuv420) -> Vec<u8> {
    let mut out = vec![0; img.width as usize * img.height as usize * 3];
    let _ = i420_to_rgb_into(img, &mut out, img.width);
    out
}

/// Nearest-neighbour resize of every plane
pub fn scale_i420(img: &Yuv420, width: u32, height: u32) -> Result<Yuv420, ConvertError> {
    if img.width == width && img.height == height {
        return Ok(img.clone());
    }
    let mut out = Yuv420::new(width, height)?;
    scale_plane(
        &img.y,
        img.width as usize,
        img.height as usize,
        &mut out.y,
        width as usize,
        height as usize,
    );
    let (scw, sch) = (img.chroma_width(), img.chroma_height());
    let (dcw, dch) = (out.chroma_width(), out.chroma_height());
    scale_plane(&img.u, scw, sch, &mut out.u, dcw, dch);
    scale_plane(&img.v, scw, sch, &mut out.v, dcw, dch);
    Ok(out)
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            dst[y * dw + x] = src[sy * sw + x * sw / dw];
        }
    }
}

/// Clockwise rotation of tightly packed RGB24 by 0, 90, 180 or 270 degrees.
/// Returns the rotated pixels and their width/height.
pub fn rotate_rgb(rgb: &[u8], width: u32, height: u32, degrees: u32) -> (Vec<u8>, u32, u32) {
    let (w, h) = (width as usize, height as usize);
    match degrees % 360 {
        90 => {
            let mut out = vec![0; w * h * 3];
            for y in 0..h {
                for x in 0..w {
                    let (nx, ny) = (h - 1 - y, x);
                    let d = (ny * h + nx) * 3;
                    out[d..d + 3].copy_from_slice(&rgb[(y * w + x) * 3..(y * w + x) * 3 + 3]);
                }
            }
            (out, height, width)
        }
        180 => {
            let mut out = vec![0; w * h * 3];
            for y in 0..h {
                for x in 0..w {
                    let d = ((h - 1 - y) * w + (w - 1 - x)) * 3;
                    out[d..d + 3].copy_from_slice(&rgb[(y * w + x) * 3..(y * w + x) * 3 + 3]);
                }
            }
            (out, width, height)
        }
        270 => {
            let mut out = vec![0; w * h * 3];
            for y in 0..h {
                for x in 0..w {
                    let (nx, ny) = (y, w - 1 - x);
                    let d = (ny * h + nx) * 3;
                    out[d..d + 3].copy_from_slice(&rgb[(y * w + x) * 3..(y * w + x) * 3 + 3]);
                }
            }
            (out, height, width)
        }
        _ => (rgb[..w * h * 3].to_vec(), width, height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Yuv420 {
        let mut img = Yuv420::new(width, height).unwrap();
        for (i, px) in img.y.iter_mut().enumerate() {
            *px = (i * 7 % 251) as u8;
        }
        for (i, px) in img.u.iter_mut().enumerate() {
            *px = (i * 3 % 256) as u8;
        }
        for (i, px) in img.v.iter_mut().enumerate() {
            *px = (255 - i * 5 % 256) as u8;
        }
        img
    }

    #[test]
    fn test_odd_geometry_rejected() {
        assert!(Yuv420::new(3, 4).is_err());
        assert!(yuyv_to_i420(&[0; 64], 4, 3, 4).is_err());
    }

    #[test]
    fn test_yuyv_planar_luma_round_trip() {
        let img = gradient(16, 8);
        let packed = i420_to_yuyv(&img);
        let back = yuyv_to_i420(&packed, 16, 8, 16).unwrap();
        assert_eq!(back.y, img.y);
    }

    #[test]
    fn test_yuyv_to_nv21_and_yv12_keep_luma() {
        let img = gradient(32, 4);
        let packed = i420_to_yuyv(&img);

        let nv21 = yuyv_to_nv21(&packed, 32, 4).unwrap();
        assert_eq!(&nv21[..32 * 4], &img.y[..]);
        let back = nv21_to_i420(&nv21, 32, 4, 32).unwrap();
        assert_eq!(back.y, img.y);

        let yv12 = yuyv_to_yv12(&packed, 32, 4).unwrap();
        let back = yv12_to_i420(&yv12, 32, 4, 32).unwrap();
        assert_eq!(back.y, img.y);
    }

    #[test]
    fn test_semi_planar_round_trip_is_lossless() {
        let img = gradient(8, 6);
        let mut nv21 = vec![0; 8 * 6 * 3 / 2];
        i420_to_nv21_into(&img, &mut nv21, 8).unwrap();
        assert_eq!(nv21_to_i420(&nv21, 8, 6, 8).unwrap(), img);
    }

    #[test]
    fn test_yv12_round_trip_with_padded_chroma() {
        // 20 px wide: chroma rows are 10 px, stored 16 apart
        let img = gradient(20, 4);
        let mut yv12 = vec![0; crate::capture::frame::yv12_size(20, 4)];
        i420_to_yv12_into(&img, &mut yv12, 20).unwrap();
        assert_eq!(yv12_to_i420(&yv12, 20, 4, 20).unwrap(), img);
    }

    #[test]
    fn test_strided_nv21_write() {
        let img = gradient(4, 2);
        let mut dst = vec![0xAA; 8 * 2 * 3 / 2];
        i420_to_nv21_into(&img, &mut dst, 8).unwrap();
        assert_eq!(&dst[0..4], &img.y[0..4]);
        // padding untouched
        assert_eq!(&dst[4..8], &[0xAA; 4]);
        assert_eq!(nv21_to_i420(&dst, 4, 2, 8).unwrap(), img);
    }

    #[test]
    fn test_chroma_is_averaged_vertically() {
        // 2x2 YUYV: top row U=10 V=20, bottom row U=11 V=40
        let packed = [50, 10, 60, 20, 70, 11, 80, 40];
        let img = yuyv_to_i420(&packed, 2, 2, 2).unwrap();
        assert_eq!(img.y, vec![50, 60, 70, 80]);
        assert_eq!(img.u, vec![11]);
        assert_eq!(img.v, vec![30]);
    }

    #[test]
    fn test_rgb_gray_maps_to_neutral_chroma() {
        let rgb = vec![128u8; 4 * 4 * 3];
        let img = rgb_to_i420(&rgb, 4, 4).unwrap();
        assert!(img.y.iter().all(|&y| y == 128));
        assert!(img.u.iter().all(|&u| u == 128));
        assert!(img.v.iter().all(|&v| v == 128));
        let back = i420_to_rgb(&img);
        assert!(back.iter().all(|&c| c == 128));
    }

    #[test]
    fn test_scale_i420_dimensions() {
        let img = gradient(16, 8);
        let small = scale_i420(&img, 8, 4).unwrap();
        assert_eq!(small.y.len(), 32);
        assert_eq!(small.u.len(), 8);
        assert_eq!(small.y[0], img.y[0]);
        assert_eq!(small.y[1], img.y[2]);
    }

    #[test]
    fn test_rotate_rgb() {
        // 2x1 image: red, green
        let rgb = [255, 0, 0, 0, 255, 0];
        let (rot, w, h) = rotate_rgb(&rgb, 2, 1, 90);
        assert_eq!((w, h), (1, 2));
        assert_eq!(rot, vec![255, 0, 0, 0, 255, 0]);

        let (rot, w, h) = rotate_rgb(&rgb, 2, 1, 180);
        assert_eq!((w, h), (2, 1));
        assert_eq!(rot, vec![0, 255, 0, 255, 0, 0]);

        let (rot, w, h) = rotate_rgb(&rgb, 2, 1, 270);
        assert_eq!((w, h), (1, 2));
        assert_eq!(rot, vec![0, 255, 0, 255, 0, 0]);
    }
}
