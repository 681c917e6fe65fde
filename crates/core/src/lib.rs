pub mod backend;
pub mod config;
pub mod data;
pub mod error;
pub mod kernels;
pub mod launch;
pub mod nn;
pub mod ops_cpu;
pub mod profiler;
pub mod shape;
pub mod snapshot;
pub mod tensor;
pub mod train;

pub use backend::{Backend, Device, Pass};
pub use config::NetworkConfig;
pub use error::{NnError, Result};
pub use kernels::KernelRegistry;
pub use launch::LaunchConfig;
pub use nn::graph::Network;
pub use ops_cpu::CpuDevice;
pub use shape::Shape;
pub use tensor::{TensorId, TensorKind};
