use anyhow::{anyhow, Result};
use std::path::Path;

/// Preprocessed model input: one RGB image, NHWC, batch size 1, 8-bit.
#[derive(Clone, Debug)]
pub struct InputTensor {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl InputTensor {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(anyhow!(
                "input tensor {}x{} expects {} bytes, received {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// `[batch, height, width, channels]`.
    pub fn shape(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, 3]
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGB bytes in row-major order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rgb_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }
}

/// Raw detector output, shape `[N, 5 + C]`.
///
/// Each row is `cx, cy, w, h, objectness, class_score_0 .. class_score_{C-1}`
/// in model input pixel space.
#[derive(Clone, Debug)]
pub struct RawOutput {
    data: Vec<f32>,
    row_len: usize,
}

/// Box params plus objectness preceding the class scores.
pub const ROW_PREFIX: usize = 5;

impl RawOutput {
    pub fn new(data: Vec<f32>, row_len: usize) -> Result<Self> {
        if row_len <= ROW_PREFIX {
            return Err(anyhow!(
                "raw output rows need more than {} values, got {}",
                ROW_PREFIX,
                row_len
            ));
        }
        if data.len() % row_len != 0 {
            return Err(anyhow!(
                "raw output length {} is not a multiple of row length {}",
                data.len(),
                row_len
            ));
        }
        Ok(Self { data, row_len })
    }

    /// Build from rows, checking they all have the same length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let row_len = rows.first().map(Vec::len).unwrap_or(ROW_PREFIX + 1);
        if rows.iter().any(|r| r.len() != row_len) {
            return Err(anyhow!("raw output rows have inconsistent lengths"));
        }
        Self::new(rows.concat(), row_len)
    }

    pub fn num_rows(&self) -> usize {
        self.data.len() / self.row_len
    }

    pub fn num_classes(&self) -> usize {
        self.row_len - ROW_PREFIX
    }

    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.row_len)
    }
}

/// Inference accelerator.
///
/// Called synchronously, at most once per frame, from the pipeline thread.
pub trait Accelerator: Send {
    /// Accelerator identifier.
    fn name(&self) -> &'static str;

    /// Load a model. Failure leaves the accelerator unusable.
    fn load(&mut self, model_path: &Path) -> Result<()>;

    /// Run one forward pass.
    fn run(&mut self, input: &InputTensor) -> Result<RawOutput>;

    /// Free the loaded model. Idempotent.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_output_shape_checks() {
        assert!(RawOutput::new(vec![0.0; 10], 5).is_err());
        assert!(RawOutput::new(vec![0.0; 13], 6).is_err());
        let raw = RawOutput::new(vec![0.0; 28], 14).unwrap();
        assert_eq!(raw.num_rows(), 2);
        assert_eq!(raw.num_classes(), 9);
        assert_eq!(raw.rows().count(), 2);
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        assert!(RawOutput::from_rows(&[vec![0.0; 6], vec![0.0; 7]]).is_err());
        let empty = RawOutput::from_rows(&[]).unwrap();
        assert_eq!(empty.num_rows(), 0);
    }

    #[test]
    fn input_tensor_layout() {
        let tensor = InputTensor::new(vec![1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert_eq!(tensor.shape(), [1, 1, 2, 3]);
        assert_eq!(tensor.rgb_at(1, 0), Some([4, 5, 6]));
        assert!(InputTensor::new(vec![0; 5], 2, 1).is_err());
    }
}
