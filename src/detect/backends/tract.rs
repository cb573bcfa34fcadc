#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{Accelerator, InputTensor, RawOutput};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

/// Tract-based accelerator for YOLO-style ONNX models.
///
/// The model takes a normalized NCHW float tensor and returns `[1, N, 5 + C]`.
pub struct TractAccelerator {
    model: Option<Plan>,
    width: u32,
    height: u32,
}

impl TractAccelerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            model: None,
            width,
            height,
        }
    }

    fn build_input(&self, input: &InputTensor) -> Result<Tensor> {
        if input.width() != self.width || input.height() != self.height {
            return Err(anyhow!(
                "input {}x{} does not match model input {}x{}",
                input.width(),
                input.height(),
                self.width,
                self.height
            ));
        }
        let width = self.width as usize;
        let pixels = input.data();
        let tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| pixels[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(tensor.into_tensor())
    }
}

impl Accelerator for TractAccelerator {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load(&mut self, model_path: &Path) -> Result<()> {
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, self.height as usize, self.width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        self.model = Some(model);
        Ok(())
    }

    fn run(&mut self, input: &InputTensor) -> Result<RawOutput> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract model is not loaded"))?;
        let tensor = self.build_input(input)?;
        let outputs = model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let row_len = *view
            .shape()
            .last()
            .ok_or_else(|| anyhow!("model output has no dimensions"))?;
        RawOutput::new(view.iter().copied().collect(), row_len)
    }

    fn release(&mut self) {
        self.model = None;
    }
}
