use serde::{Deserialize, Serialize};

/// Dimensions of a tactile batch: `actuators × frames × taxels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchShape {
    pub actuators: usize,
    pub frames: usize,
    pub taxels: usize,
}

impl BatchShape {
    pub const fn new(actuators: usize, frames: usize, taxels: usize) -> Self {
        Self {
            actuators,
            frames,
            taxels,
        }
    }

    /// Samples per actuator (`frames × taxels`).
    pub const fn actuator_len(&self) -> usize {
        self.frames * self.taxels
    }

    pub const fn sample_count(&self) -> usize {
        self.actuators * self.frames * self.taxels
    }
}

/// Fixed-depth window of tactile rows, stored `[actuator][frame][taxel]` row-major.
///
/// Allocated once and overwritten in place. `clone_from` reuses the
/// destination's storage.
#[derive(Debug, PartialEq)]
pub struct Batch {
    shape: BatchShape,
    samples: Vec<f32>,
}

impl Clone for Batch {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape,
            samples: self.samples.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.shape = source.shape;
        self.samples.clone_from(&source.samples);
    }
}

impl Batch {
    pub fn new(shape: BatchShape) -> Self {
        Self {
            shape,
            samples: vec![0.0; shape.sample_count()],
        }
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn actuator(&self, actuator: usize) -> &[f32] {
        let len = self.shape.actuator_len();
        &self.samples[actuator * len..(actuator + 1) * len]
    }

    pub fn actuator_mut(&mut self, actuator: usize) -> &mut [f32] {
        let len = self.shape.actuator_len();
        &mut self.samples[actuator * len..(actuator + 1) * len]
    }

    /// Taxel values of one actuator at one frame.
    pub fn row(&self, actuator: usize, frame: usize) -> &[f32] {
        let start = self.offset(actuator, frame);
        &self.samples[start..start + self.shape.taxels]
    }

    /// Copy one detector's taxels into `actuator` at `frame`.
    ///
    /// Missing input, or input shorter than `taxels`, fills the gap with zeros.
    pub fn write_row(&mut self, actuator: usize, frame: usize, taxels: Option<&[f32]>) {
        let start = self.offset(actuator, frame);
        let dst = &mut self.samples[start..start + self.shape.taxels];
        let src = taxels.unwrap_or(&[]);
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        dst[n..].fill(0.0);
    }

    /// Mean absolute value of one actuator's taxels at `frame`.
    pub fn mean_intensity(&self, actuator: usize, frame: usize) -> f32 {
        let row = self.row(actuator, frame);
        if row.is_empty() {
            return 0.0;
        }
        row.iter().map(|v| v.abs()).sum::<f32>() / row.len() as f32
    }

    pub fn clear(&mut self) {
        self.samples.fill(0.0);
    }

    fn offset(&self, actuator: usize, frame: usize) -> usize {
        actuator * self.shape.actuator_len() + frame * self.shape.taxels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_actuator_frame_taxel() {
        let mut batch = Batch::new(BatchShape::new(2, 3, 2));
        assert_eq!(batch.samples().len(), 12);

        batch.write_row(0, 1, Some(&[0.1, 0.2]));
        batch.write_row(1, 1, Some(&[0.3, 0.4]));
        assert_eq!(batch.row(0, 1), &[0.1, 0.2]);
        assert_eq!(batch.row(1, 1), &[0.3, 0.4]);
        assert_eq!(
            batch.samples(),
            &[0.0, 0.0, 0.1, 0.2, 0.0, 0.0, 0.0, 0.0, 0.3, 0.4, 0.0, 0.0]
        );
        assert_eq!(batch.actuator(1), &[0.0, 0.0, 0.3, 0.4, 0.0, 0.0]);
    }

    #[test]
    fn clone_from_reuses_storage() {
        let mut source = Batch::new(BatchShape::new(2, 2, 2));
        source.samples_mut().fill(0.25);
        let mut scratch = Batch::new(BatchShape::new(2, 2, 2));
        let storage = scratch.samples().as_ptr();

        scratch.clone_from(&source);
        assert_eq!(scratch, source);
        assert_eq!(scratch.samples().as_ptr(), storage);
    }

    #[test]
    fn absent_or_short_row_is_zero_filled() {
        let mut batch = Batch::new(BatchShape::new(2, 1, 3));
        batch.samples_mut().fill(0.9);

        batch.write_row(0, 0, Some(&[0.5]));
        batch.write_row(1, 0, Some(&[0.6, 0.7, 0.8, 0.95]));
        assert_eq!(batch.samples(), &[0.5, 0.0, 0.0, 0.6, 0.7, 0.8]);

        batch.write_row(1, 0, None);
        assert_eq!(batch.samples(), &[0.5, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn mean_intensity_uses_magnitudes() {
        let mut batch = Batch::new(BatchShape::new(1, 1, 4));
        batch.write_row(0, 0, Some(&[0.5, -0.5, 0.25, -0.25]));
        assert!((batch.mean_intensity(0, 0) - 0.375).abs() < 1e-6);
    }

    #[test]
    fn zero_sized_batch_is_empty() {
        assert!(Batch::new(BatchShape::new(0, 64, 8)).is_empty());
        assert!(!Batch::new(BatchShape::new(1, 1, 1)).is_empty());
    }
}
