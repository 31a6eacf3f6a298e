use crate::recorder::common::PipelineError;
use crate::recorder::frame::Frame;
use crate::recorder::glyphs::{glyph, is_set, GLYPH_HEIGHT, GLYPH_WIDTH};
use image::imageops::{self, FilterType};
use image::RgbImage;

const LABEL_ORIGIN: (u32, u32) = (10, 16);
const LABEL_SCALE: u32 = 2;
const LABEL_BORDER: [u8; 3] = [128, 128, 128];
const LABEL_BODY: [u8; 3] = [255, 255, 255];

/// Axis a frame is mirrored around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    /// Around the horizontal axis (upside down).
    X,
    /// Around the vertical axis (mirror).
    Y,
    Both,
}

/// Combines the two flip flags into the single flip to apply, if any.
pub fn flip_axis(flip_x: bool, flip_y: bool) -> Option<FlipAxis> {
    match (flip_x, flip_y) {
        (true, true) => Some(FlipAxis::Both),
        (true, false) => Some(FlipAxis::X),
        (false, true) => Some(FlipAxis::Y),
        (false, false) => None,
    }
}

/// Blur kernels must be odd; anything at or below 1 disables the blur.
pub fn normalized_kernel(kernel: u32) -> Option<u32> {
    match kernel {
        0 | 1 => None,
        k if k % 2 == 1 => Some(k),
        k => Some(k + 1),
    }
}

/// Pixel-level transforms applied to frames before they are encoded.
pub trait ImageOps: Send + Sync {
    fn resize(&self, frame: Frame, width: u32, height: u32) -> Result<Frame, PipelineError>;

    // kernel is already normalized to an odd value > 1
    fn blur(&self, frame: Frame, kernel: u32) -> Result<Frame, PipelineError>;

    fn flip(&self, frame: Frame, axis: FlipAxis) -> Result<Frame, PipelineError>;

    fn draw_label(&self, frame: &mut Frame, label: &str) -> Result<(), PipelineError>;
}

/// Transforms built on the `image` crate. Channel order is irrelevant to every
/// operation here, so BGR data rides in an `RgbImage` untouched.
pub struct RasterOps;

fn to_image(frame: Frame) -> Result<RgbImage, PipelineError> {
    RgbImage::from_raw(frame.width, frame.height, frame.data)
        .ok_or_else(|| PipelineError::Encoding("frame buffer does not match its size".to_string()))
}

fn from_image(img: RgbImage) -> Frame {
    let (width, height) = img.dimensions();
    Frame::new(width, height, img.into_raw())
}

fn stamp(frame: &mut Frame, label: &str, color: [u8; 3], spread: u32) {
    let (mut x0, y0) = LABEL_ORIGIN;
    for c in label.chars() {
        if x0 >= frame.width {
            break;
        }
        let rows = glyph(c);
        for row in 0..GLYPH_HEIGHT {
            for col in 0..GLYPH_WIDTH {
                if !is_set(&rows, col, row) {
                    continue;
                }
                let px = x0 + col * LABEL_SCALE - spread;
                let py = y0 + row * LABEL_SCALE - spread;
                for dy in 0..LABEL_SCALE + 2 * spread {
                    for dx in 0..LABEL_SCALE + 2 * spread {
                        frame.put_pixel(px + dx, py + dy, color);
                    }
                }
            }
        }
        x0 += (GLYPH_WIDTH + 1) * LABEL_SCALE;
    }
}

impl ImageOps for RasterOps {
    fn resize(&self, frame: Frame, width: u32, height: u32) -> Result<Frame, PipelineError> {
        if frame.size() == (width, height) {
            return Ok(frame);
        }
        let img = to_image(frame)?;
        Ok(from_image(imageops::resize(&img, width, height, FilterType::Triangle)))
    }

    fn blur(&self, frame: Frame, kernel: u32) -> Result<Frame, PipelineError> {
        // same kernel-to-sigma mapping opencv uses for gaussian kernels
        let sigma = 0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8;
        let img = to_image(frame)?;
        Ok(from_image(imageops::blur(&img, sigma)))
    }

    fn flip(&self, frame: Frame, axis: FlipAxis) -> Result<Frame, PipelineError> {
        let mut img = to_image(frame)?;
        match axis {
            FlipAxis::X => imageops::flip_vertical_in_place(&mut img),
            FlipAxis::Y => imageops::flip_horizontal_in_place(&mut img),
            FlipAxis::Both => imageops::rotate180_in_place(&mut img),
        }
        Ok(from_image(img))
    }

    fn draw_label(&self, frame: &mut Frame, label: &str) -> Result<(), PipelineError> {
        // grey wide pass as border, white narrow pass as body
        stamp(frame, label, LABEL_BORDER, 1);
        stamp(frame, label, LABEL_BODY, 0);
        Ok(())
    }
}
