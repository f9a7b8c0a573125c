//! EXIF APP1 segment builder
//!
//! IFD0 with the Exif sub-IFD, an optional GPS sub-IFD and an optional IFD1
//! carrying a JPEG thumbnail, serialised by `dng` and framed as APP1.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use dng::ifd::{Ifd, IfdValue, Offsets};
use dng::tags::{gps_info, ifd};
use dng::{DngWriter, FileType};
use tracing::warn;

use crate::error::EncodeError;

const APP1_MARKER: [u8; 2] = [0xFF, 0xE1];
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";
/// Segment length field is 16 bits and counts itself
const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize - 2;

/// GPS fix to embed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Seconds since the Unix epoch, UTC
    pub timestamp: i64,
}

/// Everything written into the metadata block
#[derive(Debug, Clone)]
pub struct ExifInfo {
    pub make: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation a viewer must apply, in degrees
    pub orientation: u32,
    pub taken: DateTime<Local>,
    pub exposure: Duration,
    pub iso: u32,
    pub focal_length: Option<f32>,
    pub gps: Option<GpsInfo>,
    /// Complete JPEG stream of the thumbnail
    pub thumbnail: Option<Vec<u8>>,
}

/// Builds the opaque metadata block spliced ahead of the image payload
pub trait MetadataBuilder: Send {
    fn build(&self, info: &ExifInfo) -> Result<Vec<u8>, EncodeError>;
}

fn exif_orientation(degrees: u32) -> u16 {
    match degrees % 360 {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

/// Degrees to degrees/minutes/seconds rationals
fn dms(value: f64) -> IfdValue {
    let value = value.abs();
    let degrees = value.trunc();
    let minutes = ((value - degrees) * 60.0).trunc();
    let seconds = ((value - degrees) * 60.0 - minutes) * 60.0;
    IfdValue::List(vec![
        IfdValue::Rational(degrees as u32, 1),
        IfdValue::Rational(minutes as u32, 1),
        IfdValue::Rational((seconds * 1000.0).round() as u32, 1000),
    ])
}

fn ascii(value: impl Into<String>) -> IfdValue {
    IfdValue::Ascii(value.into())
}

/// Thumbnail JPEG stream placed by the writer, which fills in its offset
struct Thumbnail(Vec<u8>);

impl Offsets for Thumbnail {
    fn size(&self) -> u32 {
        self.0.len() as u32
    }

    fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writer.write_all(&self.0)
    }
}

/// Exposure time as a rational, 1/n for sub-second exposures
fn exposure_rational(exposure: Duration) -> (u32, u32) {
    let ns = exposure.as_nanos().max(1) as u64;
    if ns >= 1_000_000_000 {
        ((ns / 1_000_000) as u32, 1000)
    } else {
        (1, (1_000_000_000 / ns) as u32)
    }
}

/// Default EXIF writer
#[derive(Debug, Default)]
pub struct ExifBuilder;

impl ExifBuilder {
    fn exif_ifd(info: &ExifInfo, stamp: &str) -> Ifd {
        let mut exif = Ifd::default();
        let (n, d) = exposure_rational(info.exposure);
        exif.insert(ifd::ExposureTime, IfdValue::Rational(n, d));
        exif.insert(
            ifd::ISOSpeedRatings,
            IfdValue::Short(info.iso.min(u16::MAX as u32) as u16),
        );
        exif.insert(ifd::DateTimeOriginal, ascii(stamp));
        if let Some(focal) = info.focal_length {
            exif.insert(
                ifd::FocalLength,
                IfdValue::Rational((focal * 100.0).round() as u32, 100),
            );
        }
        exif
    }

    fn gps_ifd(fix: &GpsInfo) -> Ifd {
        let time = Utc
            .timestamp_opt(fix.timestamp, 0)
            .single()
            .unwrap_or_default();
        let hms = time
            .format("%H:%M:%S")
            .to_string()
            .split(':')
            .map(|part| IfdValue::Rational(part.parse().unwrap_or(0), 1))
            .collect();

        let mut gps = Ifd::default();
        gps.insert(
            gps_info::GPSVersionID,
            IfdValue::List([2, 2, 0, 0].into_iter().map(IfdValue::Byte).collect()),
        );
        gps.insert(
            gps_info::GPSLatitudeRef,
            ascii(if fix.latitude < 0.0 { "S" } else { "N" }),
        );
        gps.insert(gps_info::GPSLatitude, dms(fix.latitude));
        gps.insert(
            gps_info::GPSLongitudeRef,
            ascii(if fix.longitude < 0.0 { "W" } else { "E" }),
        );
        gps.insert(gps_info::GPSLongitude, dms(fix.longitude));
        gps.insert(
            gps_info::GPSAltitudeRef,
            IfdValue::Byte((fix.altitude < 0.0) as u8),
        );
        gps.insert(
            gps_info::GPSAltitude,
            IfdValue::Rational((fix.altitude.abs() * 100.0).round() as u32, 100),
        );
        gps.insert(gps_info::GPSTimeStamp, IfdValue::List(hms));
        gps.insert(gps_info::GPSDateStamp, ascii(time.format("%Y:%m:%d").to_string()));
        gps
    }

    /// TIFF body: IFD0 with its sub-IFDs, then IFD1 when a thumbnail is given
    fn tiff(&self, info: &ExifInfo, thumbnail: Option<&[u8]>) -> Result<Vec<u8>, EncodeError> {
        let stamp = info.taken.format("%Y:%m:%d %H:%M:%S").to_string();

        let mut ifd0 = Ifd::default();
        ifd0.insert(ifd::ImageWidth, IfdValue::Long(info.width));
        ifd0.insert(ifd::ImageLength, IfdValue::Long(info.height));
        ifd0.insert(ifd::Make, ascii(info.make.as_str()));
        ifd0.insert(ifd::Model, ascii(info.model.as_str()));
        ifd0.insert(
            ifd::Orientation,
            IfdValue::Short(exif_orientation(info.orientation)),
        );
        ifd0.insert(
            ifd::Software,
            ascii(format!("camsim v{}", env!("CARGO_PKG_VERSION"))),
        );
        ifd0.insert(ifd::DateTime, ascii(stamp.as_str()));
        ifd0.insert(ifd::ExifIFD, IfdValue::Ifd(Self::exif_ifd(info, &stamp)));
        if let Some(fix) = &info.gps {
            ifd0.insert(ifd::GPSInfoIFD, IfdValue::Ifd(Self::gps_ifd(fix)));
        }

        let mut ifds = vec![ifd0];
        if let Some(thumb) = thumbnail {
            let data: Arc<dyn Offsets + Send + Sync> = Arc::new(Thumbnail(thumb.to_vec()));
            let mut ifd1 = Ifd::default();
            // Old-style JPEG, the EXIF thumbnail convention
            ifd1.insert(ifd::Compression, IfdValue::Short(6));
            ifd1.insert(ifd::JPEGInterchangeFormat, IfdValue::Offsets(data));
            ifd1.insert(
                ifd::JPEGInterchangeFormatLength,
                IfdValue::Long(thumb.len() as u32),
            );
            ifds.push(ifd1);
        }

        let mut tiff = Vec::new();
        DngWriter::write_dng(Cursor::new(&mut tiff), true, FileType::Dng, ifds)
            .map_err(|e| EncodeError::Codec(format!("EXIF serialisation failed: {:?}", e)))?;
        Ok(tiff)
    }
}

impl MetadataBuilder for ExifBuilder {
    fn build(&self, info: &ExifInfo) -> Result<Vec<u8>, EncodeError> {
        let mut tiff = self.tiff(info, info.thumbnail.as_deref())?;
        if EXIF_HEADER.len() + tiff.len() > MAX_SEGMENT_PAYLOAD {
            warn!(
                bytes = info.thumbnail.as_ref().map_or(0, Vec::len),
                "Thumbnail too large for APP1, dropping it"
            );
            tiff = self.tiff(info, None)?;
        }
        if EXIF_HEADER.len() + tiff.len() > MAX_SEGMENT_PAYLOAD {
            return Err(EncodeError::Codec("EXIF block exceeds APP1 limit".into()));
        }

        let length = (2 + EXIF_HEADER.len() + tiff.len()) as u16;
        let mut segment = Vec::with_capacity(length as usize + 2);
        segment.extend_from_slice(&APP1_MARKER);
        segment.extend_from_slice(&length.to_be_bytes());
        segment.extend_from_slice(EXIF_HEADER);
        segment.extend_from_slice(&tiff);
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG_ORIENTATION: u16 = 0x0112;
    const TAG_EXIF_IFD: u16 = 0x8769;
    const TAG_GPS_IFD: u16 = 0x8825;
    const TAG_THUMB_OFFSET: u16 = 0x0201;
    const TAG_THUMB_LENGTH: u16 = 0x0202;
    const TAG_ISO: u16 = 0x8827;
    const TAG_EXPOSURE_TIME: u16 = 0x829A;
    const TAG_GPS_LONGITUDE_REF: u16 = 0x0003;

    fn info() -> ExifInfo {
        ExifInfo {
            make: "camsim".into(),
            model: "Synthetic Sensor".into(),
            width: 640,
            height: 480,
            orientation: 90,
            taken: Local::now(),
            exposure: Duration::from_millis(10),
            iso: 100,
            focal_length: Some(4.5),
            gps: None,
            thumbnail: None,
        }
    }

    /// Minimal reader over a TIFF body in either byte order
    struct Tiff<'a> {
        buf: &'a [u8],
        le: bool,
    }

    impl<'a> Tiff<'a> {
        fn new(buf: &'a [u8]) -> Self {
            Self {
                buf,
                le: &buf[..2] == b"II",
            }
        }

        fn u16_at(&self, at: usize) -> u16 {
            let b = [self.buf[at], self.buf[at + 1]];
            if self.le {
                u16::from_le_bytes(b)
            } else {
                u16::from_be_bytes(b)
            }
        }

        fn u32_at(&self, at: usize) -> u32 {
            let b = [self.buf[at], self.buf[at + 1], self.buf[at + 2], self.buf[at + 3]];
            if self.le {
                u32::from_le_bytes(b)
            } else {
                u32::from_be_bytes(b)
            }
        }

        fn ifd0(&self) -> usize {
            self.u32_at(4) as usize
        }

        fn next_ifd(&self, ifd: usize) -> usize {
            let n = self.u16_at(ifd) as usize;
            self.u32_at(ifd + 2 + n * 12) as usize
        }

        /// Offset of the 12-byte entry for `tag` in the IFD at `ifd`
        fn entry(&self, ifd: usize, tag: u16) -> Option<usize> {
            let n = self.u16_at(ifd) as usize;
            (0..n)
                .map(|i| ifd + 2 + i * 12)
                .find(|&e| self.u16_at(e) == tag)
        }

        /// Inline SHORT value
        fn short(&self, ifd: usize, tag: u16) -> Option<u16> {
            self.entry(ifd, tag).map(|e| self.u16_at(e + 8))
        }

        /// Inline LONG value or an offset
        fn long(&self, ifd: usize, tag: u16) -> Option<u32> {
            self.entry(ifd, tag).map(|e| self.u32_at(e + 8))
        }
    }

    #[test]
    fn test_segment_header() {
        let segment = ExifBuilder.build(&info()).unwrap();
        assert_eq!(&segment[..2], &APP1_MARKER);
        let length = u16::from_be_bytes([segment[2], segment[3]]) as usize;
        assert_eq!(length + 2, segment.len());
        assert_eq!(&segment[4..10], EXIF_HEADER);

        let tiff = Tiff::new(&segment[10..]);
        assert!(matches!(&segment[10..12], b"II" | b"MM"));
        assert_eq!(tiff.u16_at(2), 42);
    }

    #[test]
    fn test_orientation_and_sub_ifd() {
        let segment = ExifBuilder.build(&info()).unwrap();
        let tiff = Tiff::new(&segment[10..]);
        let ifd0 = tiff.ifd0();

        assert_eq!(tiff.short(ifd0, TAG_ORIENTATION), Some(6));
        let exif = tiff.long(ifd0, TAG_EXIF_IFD).unwrap() as usize;
        assert_eq!(tiff.short(exif, TAG_ISO), Some(100));

        let exposure = tiff.long(exif, TAG_EXPOSURE_TIME).unwrap() as usize;
        assert_eq!((tiff.u32_at(exposure), tiff.u32_at(exposure + 4)), (1, 100));
        assert!(tiff.entry(ifd0, TAG_GPS_IFD).is_none());
        assert_eq!(tiff.next_ifd(ifd0), 0);
    }

    #[test]
    fn test_thumbnail_in_ifd1() {
        let thumb = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let segment = ExifBuilder
            .build(&ExifInfo {
                thumbnail: Some(thumb.clone()),
                gps: Some(GpsInfo {
                    latitude: 37.422,
                    longitude: -122.084,
                    altitude: 10.0,
                    timestamp: 1_700_000_000,
                }),
                ..info()
            })
            .unwrap();
        let tiff = Tiff::new(&segment[10..]);
        let ifd1 = tiff.next_ifd(tiff.ifd0());
        assert_ne!(ifd1, 0);

        let offset = tiff.long(ifd1, TAG_THUMB_OFFSET).unwrap() as usize;
        let length = tiff.long(ifd1, TAG_THUMB_LENGTH).unwrap() as usize;
        assert_eq!(length, thumb.len());
        assert_eq!(&tiff.buf[offset..offset + length], &thumb[..]);

        let gps = tiff.long(tiff.ifd0(), TAG_GPS_IFD).unwrap() as usize;
        let lon_ref = tiff.entry(gps, TAG_GPS_LONGITUDE_REF).unwrap();
        assert_eq!(tiff.buf[lon_ref + 8], b'W');
    }

    #[test]
    fn test_oversized_thumbnail_dropped() {
        let segment = ExifBuilder
            .build(&ExifInfo {
                thumbnail: Some(vec![0; 70_000]),
                ..info()
            })
            .unwrap();
        assert!(segment.len() < 1024);
        let tiff = Tiff::new(&segment[10..]);
        assert_eq!(tiff.next_ifd(tiff.ifd0()), 0);
    }

    #[test]
    fn test_exposure_rational() {
        assert_eq!(exposure_rational(Duration::from_millis(10)), (1, 100));
        assert_eq!(exposure_rational(Duration::from_secs(2)), (2000, 1000));
    }
}
