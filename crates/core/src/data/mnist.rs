use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use crate::data::batch_queue::{Batch, BatchSource};

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

pub struct MnistDataset {
    pub images: Vec<f32>,
    pub labels: Vec<u8>,
    pub num_samples: usize,
    pub image_size: (usize, usize),
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    Ok(u32::from_be_bytes(word))
}

impl MnistDataset {
    pub fn load_train(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::load(dir.join("train-images-idx3-ubyte"), dir.join("train-labels-idx1-ubyte"))
    }

    pub fn load_test(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::load(dir.join("t10k-images-idx3-ubyte"), dir.join("t10k-labels-idx1-ubyte"))
    }

    pub fn load(images_path: impl AsRef<Path>, labels_path: impl AsRef<Path>) -> Result<Self> {
        let (images, image_size) = Self::load_images(images_path.as_ref())?;
        let labels = Self::load_labels(labels_path.as_ref())?;

        let pixels = image_size.0 * image_size.1;
        ensure!(
            images.len() == labels.len() * pixels,
            "{} images but {} labels",
            images.len() / pixels.max(1),
            labels.len()
        );

        Ok(Self {
            images,
            num_samples: labels.len(),
            labels,
            image_size,
        })
    }

    fn load_images(path: &Path) -> Result<(Vec<f32>, (usize, usize))> {
        let mut file = BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        );

        let magic = read_u32(&mut file)?;
        ensure!(magic == IMAGES_MAGIC, "{} is not an IDX image file (magic {magic})", path.display());
        let num_images = read_u32(&mut file)? as usize;
        let num_rows = read_u32(&mut file)? as usize;
        let num_cols = read_u32(&mut file)? as usize;

        let mut pixels = vec![0u8; num_images * num_rows * num_cols];
        file.read_exact(&mut pixels)
            .with_context(|| format!("{} is truncated", path.display()))?;

        let normalized = pixels.into_iter().map(|p| p as f32 / 255.0).collect();
        Ok((normalized, (num_cols, num_rows)))
    }

    fn load_labels(path: &Path) -> Result<Vec<u8>> {
        let mut file = BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        );

        let magic = read_u32(&mut file)?;
        ensure!(magic == LABELS_MAGIC, "{} is not an IDX label file (magic {magic})", path.display());
        let num_labels = read_u32(&mut file)? as usize;

        let mut labels = vec![0u8; num_labels];
        file.read_exact(&mut labels)
            .with_context(|| format!("{} is truncated", path.display()))?;
        Ok(labels)
    }

    pub fn pixels_per_image(&self) -> usize {
        self.image_size.0 * self.image_size.1
    }

    /// Copies `batch_size` samples starting at `batch_start` (wrapping around
    /// the dataset) into `batch`, labels as f32 class indices.
    pub fn fill_batch(&self, batch_start: usize, batch_size: usize, batch: &mut Batch) {
        let pixels = self.pixels_per_image();
        batch.inputs.resize(batch_size * pixels, 0.0);
        batch.labels.resize(batch_size, 0.0);
        for row in 0..batch_size {
            let i = (batch_start + row) % self.num_samples.max(1);
            batch.inputs[row * pixels..(row + 1) * pixels]
                .copy_from_slice(&self.images[i * pixels..(i + 1) * pixels]);
            batch.labels[row] = self.labels[i] as f32;
        }
    }
}

/// Endless batch stream cycling over a dataset.
pub struct MnistSource {
    dataset: Arc<MnistDataset>,
    batch_size: usize,
    cursor: usize,
}

impl MnistSource {
    pub fn new(dataset: Arc<MnistDataset>, batch_size: usize) -> Self {
        Self { dataset, batch_size, cursor: 0 }
    }
}

impl BatchSource for MnistSource {
    fn fill(&mut self, batch: &mut Batch) -> Result<bool> {
        ensure!(self.dataset.num_samples > 0, "dataset is empty");
        self.dataset.fill_batch(self.cursor, self.batch_size, batch);
        self.cursor = (self.cursor + self.batch_size) % self.dataset.num_samples;
        Ok(true)
    }
}
