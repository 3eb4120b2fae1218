//! Raw frame to GPU image conversion.
//!
//! The converter is a pure function of the frame it is handed: it validates the
//! buffer, decodes it to RGB, applies the frame's orientation, resamples to the
//! engine's input shape and writes normalized planes into a freshly allocated
//! `GpuImage`. Nothing is retained between calls.

use std::sync::Arc;

use crate::engine::InputShape;
use crate::error::ConversionError;
use crate::frame::{nv12_chroma_dims, Orientation, PixelFormat, RawFrame};
use crate::gpu::{GpuContext, GpuImage};

/// Converts frames into images sized for one engine.
#[derive(Clone)]
pub struct ImageConverter {
    gpu: Arc<GpuContext>,
    shape: InputShape,
}

impl ImageConverter {
    pub fn new(gpu: Arc<GpuContext>, shape: InputShape) -> Self {
        Self { gpu, shape }
    }

    pub fn shape(&self) -> InputShape {
        self.shape
    }

    pub fn convert(&self, frame: &RawFrame) -> Result<GpuImage, ConversionError> {
        let rgb = decode_to_rgb(frame.pixels(), frame.width, frame.height, frame.format)?;
        let (width, height) = frame.orientation.oriented_dims(frame.width, frame.height);
        let rgb = orient(&rgb, frame.width, frame.height, frame.orientation);

        // Any failure after this point drops the image, which releases it.
        let mut image = self.gpu.allocate_image(self.shape.width, self.shape.height)?;
        resample_into_planes(&rgb, width, height, &mut image);
        Ok(image)
    }
}

fn decode_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, ConversionError> {
    if width == 0 || height == 0 {
        return Err(ConversionError::EmptyFrame { width, height });
    }
    let expected = format
        .frame_len(width, height)
        .ok_or(ConversionError::DimensionsOverflow {
            width,
            height,
            format,
        })?;
    if pixels.len() != expected {
        return Err(ConversionError::LengthMismatch {
            format,
            expected,
            actual: pixels.len(),
        });
    }

    let rgb = match format {
        PixelFormat::Bgra32 => pixels
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        PixelFormat::Rgba32 => pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        PixelFormat::Rgb24 => pixels.to_vec(),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
    };
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, _) = nv12_chroma_dims(width, height);
    let y_plane = w * h;
    let uv_stride = cw * 2;
    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * uv_stride + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }
    rgb
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Rotate an interleaved RGB buffer clockwise by the orientation's angle.
fn orient(rgb: &[u8], width: u32, height: u32, orientation: Orientation) -> Vec<u8> {
    if orientation == Orientation::Upright {
        return rgb.to_vec();
    }
    let (w, h) = (width as usize, height as usize);
    let (ow, oh) = orientation.oriented_dims(width, height);
    let (ow, oh) = (ow as usize, oh as usize);
    let mut out = vec![0u8; rgb.len()];
    for v in 0..oh {
        for u in 0..ow {
            let (x, y) = match orientation {
                Orientation::Upright => (u, v),
                Orientation::Rotated90 => (v, h - 1 - u),
                Orientation::Rotated180 => (w - 1 - u, h - 1 - v),
                Orientation::Rotated270 => (w - 1 - v, u),
            };
            let src = (y * w + x) * 3;
            let dst = (v * ow + u) * 3;
            out[dst..dst + 3].copy_from_slice(&rgb[src..src + 3]);
        }
    }
    out
}

/// Bilinear resample with pixel-center alignment, normalized to `[0, 1]`.
fn resample_into_planes(rgb: &[u8], width: u32, height: u32, image: &mut GpuImage) {
    let (sw, sh) = (width as usize, height as usize);
    let (dw, dh) = (image.width() as usize, image.height() as usize);
    let plane = dw * dh;
    let scale_x = sw as f32 / dw as f32;
    let scale_y = sh as f32 / dh as f32;
    let planes = image.planes_mut();

    for oy in 0..dh {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (sh - 1) as f32);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = sy - y0 as f32;
        for ox in 0..dw {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (sw - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = sx - x0 as f32;
            for channel in 0..3 {
                let at = |x: usize, y: usize| rgb[(y * sw + x) * 3 + channel] as f32;
                let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
                let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
                let value = top * (1.0 - fy) + bottom * fy;
                planes[channel * plane + oy * dw + ox] = value / 255.0;
            }
        }
    }
}
