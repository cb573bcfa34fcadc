//! Frame to model input: resize, BGR to RGB, batch dimension.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::backend::InputTensor;
use crate::frame::{Frame, CHANNELS};

/// Convert a frame into the model's NHWC RGB input.
///
/// Pure: the frame is only read.
pub fn preprocess(frame: &Frame, input_width: u32, input_height: u32) -> Result<InputTensor> {
    let mut rgb = Vec::with_capacity(frame.byte_len());
    for px in frame.pixels().chunks_exact(CHANNELS) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    if frame.resolution() == (input_width, input_height) {
        return InputTensor::new(rgb, input_width, input_height);
    }

    let image = RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    let resized = imageops::resize(&image, input_width, input_height, FilterType::Triangle);
    InputTensor::new(resized.into_raw(), input_width, input_height)
}
