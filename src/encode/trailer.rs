//! Still buffer trailer
//!
//! Still buffers are larger than the image they carry. The last eight bytes
//! of the buffer record how much of it is payload: a little-endian `u16`
//! blob id, two bytes of padding, then the payload size as `u32`.

use crate::error::EncodeError;

pub const BLOB_ID: u16 = 0x00FF;
pub const TRAILER_SIZE: usize = 8;
/// Smallest still buffer ever allocated, trailer included
pub const MIN_STILL_BUFFER_SIZE: usize = 256 * 1024 + TRAILER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobTrailer {
    pub size: u32,
}

impl BlobTrailer {
    pub fn new(size: usize) -> Self {
        Self { size: size as u32 }
    }

    /// Write at the very end of `buf`. The payload must fit before it.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        let needed = self.size as usize + TRAILER_SIZE;
        if buf.len() < needed {
            return Err(EncodeError::BufferTooSmall {
                needed,
                capacity: buf.len(),
            });
        }
        let at = buf.len() - TRAILER_SIZE;
        let trailer = &mut buf[at..];
        trailer[0..2].copy_from_slice(&BLOB_ID.to_le_bytes());
        trailer[2..4].fill(0);
        trailer[4..8].copy_from_slice(&self.size.to_le_bytes());
        Ok(())
    }

    /// `None` if the buffer carries no trailer
    pub fn read(buf: &[u8]) -> Option<Self> {
        let at = buf.len().checked_sub(TRAILER_SIZE)?;
        let trailer = &buf[at..];
        if u16::from_le_bytes([trailer[0], trailer[1]]) != BLOB_ID {
            return None;
        }
        let size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        (size as usize <= at).then_some(Self { size })
    }
}

/// Still buffer size for a `width`x`height` picture.
///
/// Interpolates between the minimum buffer and `max_size` by picture area
/// relative to the full sensor area.
pub fn still_buffer_size(
    width: u32,
    height: u32,
    max_width: u32,
    max_height: u32,
    max_size: usize,
) -> usize {
    let max_size = max_size.max(MIN_STILL_BUFFER_SIZE);
    let full_area = max_width as u64 * max_height as u64;
    if full_area == 0 {
        return max_size;
    }
    let area = (width as u64 * height as u64).min(full_area);
    let span = (max_size - MIN_STILL_BUFFER_SIZE) as u64;
    MIN_STILL_BUFFER_SIZE + (span * area / full_area) as usize
}
