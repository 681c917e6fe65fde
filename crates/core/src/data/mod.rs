pub mod batch_queue;
pub mod mnist;

pub use batch_queue::{Batch, BatchQueue, BatchSource};
pub use mnist::{MnistDataset, MnistSource};
