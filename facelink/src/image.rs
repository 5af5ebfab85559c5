//! Raw interleaved image buffers and the few transforms the stages need.

use crate::error::{StageError, StageResult};
use crate::face::{Affine2, Point};
use serde::{Deserialize, Serialize};

/// Uncompressed interleaved 8-bit image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
}

impl Image {
    /// Wrap `data`, checking it matches the geometry
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> StageResult<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected || channels == 0 {
            return Err(StageError::ImageGeometry {
                width,
                height,
                channels,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Image with every byte set to `value`
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        Self {
            width,
            height,
            channels: channels.max(1),
            data: vec![value; width as usize * height as usize * channels.max(1) as usize],
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Channels per pixel
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Raw bytes, row-major
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the raw bytes
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels as usize
    }

    /// Channel values of one pixel
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let at = self.offset(x, y);
        &self.data[at..at + self.channels as usize]
    }

    /// Copy of the region clamped to the image bounds
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Image {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        let row = width as usize * self.channels as usize;

        let mut data = Vec::with_capacity(row * height as usize);
        for yy in y..y + height {
            let at = self.offset(x, yy);
            data.extend_from_slice(&self.data[at..at + row]);
        }
        Image {
            width,
            height,
            channels: self.channels,
            data,
        }
    }

    /// Nearest-neighbour resize
    pub fn resize(&self, width: u32, height: u32) -> Image {
        let mut out = Image::filled(width, height, self.channels, 0);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        let c = self.channels as usize;
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height.max(1) as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width.max(1) as u64) as u32;
                let src = self.offset(sx, sy);
                let dst = out.offset(x, y);
                out.data[dst..dst + c].copy_from_slice(&self.data[src..src + c]);
            }
        }
        out
    }

    /// Invert every channel value
    pub fn invert(&mut self) {
        for byte in &mut self.data {
            *byte = 255 - *byte;
        }
    }

    /// Blend `src` onto this image with its top-left corner at `(x, y)`.
    ///
    /// `opacity` 0 keeps this image, 1 replaces it. Pixels outside the image
    /// and channel-count mismatches are skipped.
    pub fn blend(&mut self, src: &Image, x: u32, y: u32, opacity: f32) {
        if src.channels != self.channels {
            return;
        }
        let opacity = opacity.clamp(0.0, 1.0);
        let c = self.channels as usize;
        let width = src.width.min(self.width.saturating_sub(x));
        let height = src.height.min(self.height.saturating_sub(y));
        for yy in 0..height {
            for xx in 0..width {
                let s = src.offset(xx, yy);
                let d = self.offset(x + xx, y + yy);
                for i in 0..c {
                    let a = self.data[d + i] as f32;
                    let b = src.data[s + i] as f32;
                    self.data[d + i] = (a + (b - a) * opacity).round() as u8;
                }
            }
        }
    }

    /// Nearest pixel at a real-valued position, if inside the image
    fn sample(&self, p: Point) -> Option<&[u8]> {
        let (x, y) = (p.0.floor(), p.1.floor());
        if x < 0.0 || y < 0.0 || x >= self.width as f32 || y >= self.height as f32 {
            return None;
        }
        Some(self.pixel(x as u32, y as u32))
    }

    /// Resample into a `width` x `height` image.
    ///
    /// `to_source` maps output pixel centres into this image; what falls
    /// outside it comes out black.
    pub fn warp_affine(&self, to_source: &Affine2, width: u32, height: u32) -> Image {
        let mut out = Image::filled(width, height, self.channels, 0);
        let c = self.channels as usize;
        for y in 0..height {
            for x in 0..width {
                let p = to_source.apply((x as f32 + 0.5, y as f32 + 0.5));
                if let Some(px) = self.sample(p) {
                    let at = out.offset(x, y);
                    out.data[at..at + c].copy_from_slice(px);
                }
            }
        }
        out
    }

    /// Single-channel mask, 255 inside the axis-aligned ellipse and 0 outside
    pub fn ellipse_mask(width: u32, height: u32, center: Point, radii: Point) -> Image {
        let mut out = Image::filled(width, height, 1, 0);
        let (rx, ry) = (radii.0.max(0.5), radii.1.max(0.5));
        for y in 0..height {
            for x in 0..width {
                let dx = (x as f32 + 0.5 - center.0) / rx;
                let dy = (y as f32 + 0.5 - center.1) / ry;
                if dx * dx + dy * dy <= 1.0 {
                    let at = out.offset(x, y);
                    out.data[at] = 255;
                }
            }
        }
        out
    }

    /// Scale this mask by `other`, both single-channel of the same size.
    /// Anything else leaves this mask unchanged.
    pub fn multiply_mask(&mut self, other: &Image) {
        if self.channels != 1 || other.channels != 1 || self.width != other.width || self.height != other.height {
            return;
        }
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a = ((u16::from(*a) * u16::from(b) + 127) / 255) as u8;
        }
    }

    /// Paste `src` through the transform `to_src` (this image's pixels to
    /// `src` pixels), weighting each pixel by `mask` (single-channel, the
    /// size of `src`) times `opacity`.
    ///
    /// Only the region `src` covers is visited.
    pub fn composite(&mut self, src: &Image, mask: Option<&Image>, to_src: &Affine2, opacity: f32) {
        if src.channels != self.channels {
            return;
        }
        let Some(from_src) = to_src.invert() else {
            return;
        };
        let mask = mask.filter(|m| m.channels == 1 && m.width == src.width && m.height == src.height);
        let opacity = opacity.clamp(0.0, 1.0);

        let (sw, sh) = (src.width as f32, src.height as f32);
        let corners = [(0.0, 0.0), (sw, 0.0), (sw, sh), (0.0, sh)].map(|p| from_src.apply(p));
        let lo = |f: fn(&Point) -> f32| corners.iter().map(f).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let hi = |f: fn(&Point) -> f32| corners.iter().map(f).fold(f32::NEG_INFINITY, f32::max).ceil().max(0.0) as u32;
        let (x0, x1) = (lo(|p| p.0), hi(|p| p.0).min(self.width));
        let (y0, y1) = (lo(|p| p.1), hi(|p| p.1).min(self.height));

        let c = self.channels as usize;
        for y in y0..y1 {
            for x in x0..x1 {
                let q = to_src.apply((x as f32 + 0.5, y as f32 + 0.5));
                let Some(px) = src.sample(q) else {
                    continue;
                };
                let weight = mask.and_then(|m| m.sample(q)).map_or(1.0, |m| f32::from(m[0]) / 255.0) * opacity;
                let d = self.offset(x, y);
                for i in 0..c {
                    let a = f32::from(self.data[d + i]);
                    let b = f32::from(px[i]);
                    self.data[d + i] = (a + (b - a) * weight).round() as u8;
                }
            }
        }
    }

    /// Binary PPM (3 channels) or PGM (1 channel) encoding
    pub fn to_pnm(&self) -> Option<Vec<u8>> {
        let magic = match self.channels {
            1 => "P5",
            3 => "P6",
            _ => return None,
        };
        let mut out = format!("{}\n{} {}\n255\n", magic, self.width, self.height).into_bytes();
        out.extend_from_slice(&self.data);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Image {
        let data = (0..width * height).map(|i| i as u8).collect();
        Image::new(width, height, 1, data).unwrap()
    }

    #[test]
    fn test_geometry_is_checked() {
        assert!(Image::new(2, 2, 3, vec![0; 12]).is_ok());
        assert!(matches!(
            Image::new(2, 2, 3, vec![0; 11]),
            Err(StageError::ImageGeometry { len: 11, .. })
        ));
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let img = gradient(4, 4);
        let c = img.crop(2, 2, 10, 10);
        assert_eq!((c.width(), c.height()), (2, 2));
        assert_eq!(c.data(), &[10, 11, 14, 15]);
    }

    #[test]
    fn test_resize_nearest() {
        let img = gradient(2, 2);
        let big = img.resize(4, 4);
        assert_eq!(big.pixel(3, 3), &[3]);
        assert_eq!(big.pixel(0, 1), &[0]);
        assert_eq!(big.resize(2, 2), img);
    }

    #[test]
    fn test_blend_and_invert() {
        let mut dst = Image::filled(4, 4, 3, 0);
        let mut src = Image::filled(2, 2, 3, 0);
        src.invert();
        dst.blend(&src, 3, 3, 0.5);
        assert_eq!(dst.pixel(3, 3), &[128, 128, 128]);
        assert_eq!(dst.pixel(2, 2), &[0, 0, 0]);
    }

    #[test]
    fn test_warp_with_scale_matches_crop() {
        let img = gradient(8, 8);
        // Output pixel (x, y) reads source pixel (x + 2, y + 4)
        let shift = Affine2 {
            m: [1.0, 0.0, 2.0, 0.0, 1.0, 4.0],
        };
        assert_eq!(img.warp_affine(&shift, 4, 4), img.crop(2, 4, 4, 4));

        // Reaching past the edge gives black
        let out = img.warp_affine(&shift, 8, 8);
        assert_eq!(out.pixel(7, 7), &[0]);
    }

    #[test]
    fn test_ellipse_mask_and_multiply() {
        let mut mask = Image::ellipse_mask(10, 10, (5.0, 5.0), (3.0, 3.0));
        assert_eq!(mask.pixel(5, 5), &[255]);
        assert_eq!(mask.pixel(0, 0), &[0]);

        let half = Image::filled(10, 10, 1, 128);
        mask.multiply_mask(&half);
        assert_eq!(mask.pixel(5, 5), &[128]);
        assert_eq!(mask.pixel(0, 0), &[0]);

        // Mismatched sizes are ignored
        mask.multiply_mask(&Image::filled(2, 2, 1, 0));
        assert_eq!(mask.pixel(5, 5), &[128]);
    }

    #[test]
    fn test_composite_respects_mask_and_region() {
        let mut dst = Image::filled(8, 8, 1, 0);
        let src = Image::filled(4, 4, 1, 200);
        // Frame pixels (2..6, 2..6) map onto the source
        let to_src = Affine2 {
            m: [1.0, 0.0, -2.0, 0.0, 1.0, -2.0],
        };
        let mut mask = Image::filled(4, 4, 1, 255);
        mask.data[0] = 0;

        dst.composite(&src, Some(&mask), &to_src, 0.5);
        assert_eq!(dst.pixel(3, 3), &[100]);
        // Masked out, and outside the pasted region
        assert_eq!(dst.pixel(2, 2), &[0]);
        assert_eq!(dst.pixel(6, 6), &[0]);
        assert_eq!(dst.pixel(1, 4), &[0]);
    }

    #[test]
    fn test_pnm_header() {
        let pnm = Image::filled(2, 1, 3, 7).to_pnm().unwrap();
        assert!(pnm.starts_with(b"P6\n2 1\n255\n"));
        assert_eq!(pnm.len(), 11 + 6);
        assert!(Image::filled(1, 1, 4, 0).to_pnm().is_none());
    }
}
