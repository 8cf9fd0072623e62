use std::fmt::{Display, Formatter};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

pub mod capture;
pub mod frame;
pub mod loopback;
pub mod mirror;
pub mod pump;

#[cfg(feature = "xcap")]
pub mod xcap_backend;

pub use capture::FrameCapturePipeline;
pub use frame::{FrameBufferSource, FrameProducer};
pub use mirror::{DisplayMirror, SinkKind};

// ============================================================================
// Geometry
// ============================================================================

/// Size and density of the physical display being mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32, density_dpi: u32) -> Self {
        Self {
            width,
            height,
            density_dpi,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> u64 {
        (self.width as u64) * (self.height as u64)
    }
}

impl Display for Geometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}dpi", self.width, self.height, self.density_dpi)
    }
}

// ============================================================================
// Raw buffers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgba8888,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8888 => 4,
        }
    }
}

/// A single-plane buffer as written by the mirror, rows possibly padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBuffer {
    pub width: u32,
    pub height: u32,
    pub pixel_stride: usize,
    pub row_stride: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawBuffer {
    /// Buffer whose rows carry no padding.
    pub fn packed(width: u32, height: u32, data: Vec<u8>) -> Self {
        let pixel_stride = PixelFormat::Rgba8888.bytes_per_pixel();
        Self {
            width,
            height,
            pixel_stride,
            row_stride: pixel_stride * width as usize,
            format: PixelFormat::Rgba8888,
            data,
        }
    }

    /// Visible bytes of row `y`, padding excluded.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let start = (y as usize).checked_mul(self.row_stride)?;
        let len = self.pixel_stride * self.width as usize;
        self.data.get(start..start + len)
    }

    /// Copy of the visible pixels with row padding removed.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut packed = Vec::with_capacity(self.pixel_stride * self.width as usize * self.height as usize);
        for y in 0..self.height {
            match self.row(y) {
                Some(row) => packed.extend_from_slice(row),
                None => break,
            }
        }
        packed
    }
}

// ============================================================================
// Row padding correction
// ============================================================================

/// How a padded buffer lays out in a decode image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingLayout {
    /// Bytes of padding at the end of each row.
    pub row_padding: usize,
    /// Width in pixels of the oversized intermediate image.
    pub padded_width: u32,
}

pub fn padding_layout(pixel_stride: usize, row_stride: usize, width: u32) -> Option<PaddingLayout> {
    if pixel_stride == 0 {
        return None;
    }
    let row_padding = row_stride.checked_sub(pixel_stride * width as usize)?;
    let padded_width = width as usize + row_padding / pixel_stride;
    Some(PaddingLayout {
        row_padding,
        padded_width: u32::try_from(padded_width).ok()?,
    })
}

/// Decode a padded RGBA buffer into a frame of its logical size.
///
/// The raw bytes are laid into an image `padded_width` pixels wide, which is then
/// cropped back to `width x height`; the intermediate image is dropped here.
pub fn decode_padded(buffer: &RawBuffer) -> Option<Frame> {
    if buffer.pixel_stride != buffer.format.bytes_per_pixel() || buffer.width == 0 || buffer.height == 0 {
        return None;
    }
    let layout = padding_layout(buffer.pixel_stride, buffer.row_stride, buffer.width)?;

    let len = layout.padded_width as usize * buffer.pixel_stride * buffer.height as usize;
    let mut bytes = vec![0u8; len];
    // The last row often comes without its padding.
    let n = len.min(buffer.data.len());
    bytes[..n].copy_from_slice(&buffer.data[..n]);

    let padded = RgbaImage::from_raw(layout.padded_width, buffer.height, bytes)?;
    let image = image::imageops::crop_imm(&padded, 0, 0, buffer.width, buffer.height).to_image();

    Some(Frame {
        image,
        format: buffer.format,
    })
}

// ============================================================================
// Frames
// ============================================================================

/// A decoded still frame. Owned by the caller once returned.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbaImage,
    format: PixelFormat,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_buffer(width: u32, height: u32, row_stride: usize) -> RawBuffer {
        let mut data = vec![0xAB; row_stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let offset = y * row_stride + x * 4;
                data[offset..offset + 4].copy_from_slice(&[x as u8, y as u8, 7, 255]);
            }
        }
        RawBuffer {
            width,
            height,
            pixel_stride: 4,
            row_stride,
            format: PixelFormat::Rgba8888,
            data,
        }
    }

    #[test]
    fn test_padding_layout_one_pixel() {
        let layout = padding_layout(4, 2164, 540).unwrap();
        assert_eq!(layout.row_padding, 4);
        assert_eq!(layout.padded_width, 541);
    }

    #[test]
    fn test_padding_layout_aligned_stride() {
        // 540 * 4 = 2160 bytes of pixels, 16 bytes (4 pixels) of padding.
        let layout = padding_layout(4, 2176, 540).unwrap();
        assert_eq!(layout.row_padding, 16);
        assert_eq!(layout.padded_width, 544);
    }

    #[test]
    fn test_padding_layout_rejects_short_stride() {
        assert!(padding_layout(4, 2000, 540).is_none());
        assert!(padding_layout(0, 2176, 540).is_none());
    }

    #[test]
    fn test_decode_crops_padding_column() {
        let buffer = padded_buffer(540, 3, 2176);
        let frame = decode_padded(&buffer).unwrap();

        assert_eq!(frame.width(), 540);
        assert_eq!(frame.height(), 3);
        for y in 0..3 {
            for x in [0u32, 1, 538, 539] {
                let px = frame.as_image().get_pixel(x, y);
                assert_eq!(px.0, [x as u8, y as u8, 7, 255], "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_decode_tolerates_unpadded_last_row() {
        let mut buffer = padded_buffer(8, 2, 48);
        buffer.data.truncate(48 + 32);
        let frame = decode_padded(&buffer).unwrap();
        assert_eq!(frame.as_image().get_pixel(7, 1).0, [7, 1, 7, 255]);
    }

    #[test]
    fn test_to_packed_strips_padding() {
        let buffer = padded_buffer(2, 2, 16);
        assert_eq!(
            buffer.to_packed(),
            vec![0, 0, 7, 255, 1, 0, 7, 255, 0, 1, 7, 255, 1, 1, 7, 255]
        );
    }
}
