//! Host reference device. Every kernel the graph emits has a native Rust
//! implementation here, selected by name when the backend compiles it.

pub mod activation;
pub mod conv;
pub mod elementwise;
pub mod matmul;
pub mod optim;
pub mod pool;
pub mod softmax;

use log::debug;

use crate::backend::{AccessMode, ArgBinding, Device, Scalar};
use crate::error::{NnError, Result};
use crate::launch::LaunchConfig;

pub type HostKernelFn = fn(&mut HostArgs) -> Result<()>;

/// Allocation id inside a [`CpuDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostBuffer(usize);

#[derive(Clone, Debug)]
pub struct HostKernel {
    name: String,
    run: HostKernelFn,
}

impl HostKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

enum HostArg {
    Buffer { data: Vec<f32>, dirty: bool },
    Scalar(Scalar),
    Bytes(Vec<u8>),
}

/// Kernel arguments copied out of device memory for one launch.
pub struct HostArgs {
    args: Vec<HostArg>,
    launch: LaunchConfig,
}

impl HostArgs {
    fn get(&self, index: usize) -> Result<&HostArg> {
        self.args
            .get(index)
            .ok_or_else(|| NnError::Device(format!("missing kernel argument {index}")))
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        match self.get(index)? {
            HostArg::Scalar(Scalar::I32(v)) => Ok(*v),
            HostArg::Scalar(Scalar::U32(v)) => Ok(*v as i32),
            _ => Err(NnError::Device(format!("argument {index} is not an integer"))),
        }
    }

    /// A non-negative integer argument.
    pub fn extent(&self, index: usize) -> Result<usize> {
        let value = self.int(index)?;
        usize::try_from(value).map_err(|_| NnError::Device(format!("argument {index} is negative ({value})")))
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.get(index)? {
            HostArg::Scalar(Scalar::F32(v)) => Ok(*v),
            HostArg::Scalar(Scalar::I32(v)) => Ok(*v as f32),
            HostArg::Scalar(Scalar::U32(v)) => Ok(*v as f32),
            _ => Err(NnError::Device(format!("argument {index} is not a scalar"))),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.get(index)? {
            HostArg::Bytes(bytes) => Ok(bytes),
            _ => Err(NnError::Device(format!("argument {index} is not a blob"))),
        }
    }

    /// The first `n` elements of a buffer argument.
    pub fn buf(&self, index: usize, n: usize) -> Result<&[f32]> {
        match self.get(index)? {
            HostArg::Buffer { data, .. } if data.len() >= n => Ok(&data[..n]),
            HostArg::Buffer { data, .. } => Err(NnError::Device(format!(
                "argument {index} holds {} elements, kernel needs {n}",
                data.len()
            ))),
            _ => Err(NnError::Device(format!("argument {index} is not a buffer"))),
        }
    }

    /// Moves a buffer argument out for writing; hand it back with [`HostArgs::put`].
    pub fn take(&mut self, index: usize, n: usize) -> Result<Vec<f32>> {
        let arg = self
            .args
            .get_mut(index)
            .ok_or_else(|| NnError::Device(format!("missing kernel argument {index}")))?;
        match arg {
            HostArg::Buffer { data, .. } if data.len() >= n => Ok(std::mem::take(data)),
            HostArg::Buffer { data, .. } => Err(NnError::Device(format!(
                "argument {index} holds {} elements, kernel needs {n}",
                data.len()
            ))),
            _ => Err(NnError::Device(format!("argument {index} is not a buffer"))),
        }
    }

    pub fn put(&mut self, index: usize, values: Vec<f32>) {
        if let Some(HostArg::Buffer { data, dirty }) = self.args.get_mut(index) {
            *data = values;
            *dirty = true;
        }
    }
}

#[cfg(test)]
fn test_args(args: Vec<HostArg>) -> HostArgs {
    test_args_with_launch(args, LaunchConfig::single())
}

#[cfg(test)]
fn test_args_with_launch(args: Vec<HostArg>, launch: LaunchConfig) -> HostArgs {
    HostArgs { args, launch }
}

#[cfg(test)]
fn buf(values: &[f32]) -> HostArg {
    HostArg::Buffer { data: values.to_vec(), dirty: false }
}

#[cfg(test)]
fn int(value: i32) -> HostArg {
    HostArg::Scalar(Scalar::I32(value))
}

#[cfg(test)]
fn float(value: f32) -> HostArg {
    HostArg::Scalar(Scalar::F32(value))
}

/// Runs kernels on the host over plain `Vec<f32>` allocations.
pub struct CpuDevice {
    alignment: usize,
    memory: Vec<Vec<f32>>,
}

impl CpuDevice {
    pub const DEFAULT_ALIGNMENT: usize = 64;

    pub fn new() -> Self {
        Self {
            alignment: Self::DEFAULT_ALIGNMENT,
            memory: Vec::new(),
        }
    }

    pub fn with_alignment(alignment: usize) -> Result<Self> {
        if alignment == 0 || alignment % std::mem::size_of::<f32>() != 0 {
            return Err(NnError::Device(format!(
                "host alignment must be a non-zero multiple of 4, got {alignment}"
            )));
        }
        Ok(Self { alignment, memory: Vec::new() })
    }

    /// Total bytes allocated so far.
    pub fn allocated_bytes(&self) -> usize {
        self.memory.iter().map(|m| m.len() * std::mem::size_of::<f32>()).sum()
    }

    fn window(&self, buffer: &HostBuffer, offset: usize, len: usize) -> Result<(usize, usize)> {
        let word = std::mem::size_of::<f32>();
        if offset % word != 0 || len % word != 0 {
            return Err(NnError::Device(format!(
                "host transfers must be 4-byte aligned (offset {offset}, len {len})"
            )));
        }
        let memory = self
            .memory
            .get(buffer.0)
            .ok_or_else(|| NnError::Device(format!("unknown host allocation {}", buffer.0)))?;
        let start = offset / word;
        let end = start + len / word;
        if end > memory.len() {
            return Err(NnError::Range(format!(
                "{} bytes at offset {} exceed host allocation of {} bytes",
                len,
                offset,
                memory.len() * word
            )));
        }
        Ok((start, end))
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn host_kernel(name: &str) -> Option<HostKernelFn> {
    let run: HostKernelFn = match name {
        "Copy" => elementwise::copy,
        "CopyAdd" => elementwise::copy_add,
        "Add" => elementwise::add,
        "ElemWiseProduct" => elementwise::elem_wise_product,
        "ElemWiseProductAdd" => elementwise::elem_wise_product_add,
        "SubtractFromConst" => elementwise::subtract_from_const,
        "SubtractFromConstGrad" => elementwise::subtract_from_const_grad,
        "AddToMatrix" => elementwise::add_to_matrix,
        "AddToMatrixGrad" => elementwise::add_to_matrix_grad,
        "AddToImageTensor" => elementwise::add_to_image_tensor,
        "AddToImageTensorGrad" => elementwise::add_to_image_tensor_grad,
        "SplitData" => elementwise::split_data,
        "SplitDataGrad" => elementwise::split_data_grad,
        "AppendId" => elementwise::append_id,
        "ReLU" => activation::relu,
        "ReLUGrad" => activation::relu_grad,
        "Sigmoid" => activation::sigmoid,
        "SigmoidGrad" => activation::sigmoid_grad,
        "Tanh" => activation::tanh,
        "TanhGrad" => activation::tanh_grad,
        "MatrixMul" => matmul::matrix_mul,
        "MatrixMulAdd" => matmul::matrix_mul_add,
        "Transpose" => matmul::transpose,
        "Softmax" => softmax::softmax,
        "SoftmaxGrad" => softmax::softmax_grad,
        "MeanSquaredError" => softmax::mean_squared_error,
        "MeanSquaredErrorGrad" => softmax::mean_squared_error_grad,
        "CrossEntropy" => softmax::cross_entropy,
        "CrossEntropyGrad" => softmax::cross_entropy_grad,
        "ClassificationAccuracy" => softmax::classification_accuracy,
        "Convolution" => conv::convolution,
        "ConvolutionAdd" => conv::convolution_add,
        "ConvolutionWeightGrad" => conv::convolution_weight_grad,
        "RotateAndReorder" => conv::rotate_and_reorder,
        "MaxPooling" => pool::max_pooling,
        "MaxPoolingGrad" => pool::max_pooling_grad,
        "GradientDescent" => optim::gradient_descent,
        "Adam" => optim::adam,
        _ => return None,
    };
    Some(run)
}

impl Device for CpuDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn name(&self) -> &str {
        "host"
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn allocate(&mut self, bytes: usize, _access: AccessMode) -> Result<HostBuffer> {
        let words = bytes.div_ceil(std::mem::size_of::<f32>());
        self.memory.push(vec![0.0; words]);
        Ok(HostBuffer(self.memory.len() - 1))
    }

    fn compile(&mut self, name: &str, source: &str, defines: &[String]) -> Result<HostKernel> {
        let run = host_kernel(name).ok_or_else(|| {
            NnError::Device(format!("compilation failed: no host implementation for kernel `{name}`"))
        })?;
        debug!(
            "host kernel `{}` bound ({} bytes of source, {} defines)",
            name,
            source.len(),
            defines.len()
        );
        Ok(HostKernel { name: name.to_string(), run })
    }

    fn write(&mut self, buffer: &HostBuffer, offset: usize, data: &[u8]) -> Result<()> {
        let (start, end) = self.window(buffer, offset, data.len())?;
        let target = &mut self.memory[buffer.0][start..end];
        for (dst, chunk) in target.iter_mut().zip(data.chunks_exact(4)) {
            *dst = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn read(&mut self, buffer: &HostBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        let (start, end) = self.window(buffer, offset, out.len())?;
        let source = &self.memory[buffer.0][start..end];
        for (chunk, value) in out.chunks_exact_mut(4).zip(source) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(())
    }

    fn fill_zero(&mut self, buffer: &HostBuffer, offset: usize, len: usize) -> Result<()> {
        let (start, end) = self.window(buffer, offset, len)?;
        self.memory[buffer.0][start..end].fill(0.0);
        Ok(())
    }

    fn launch(
        &mut self,
        kernel: &HostKernel,
        args: &[ArgBinding<'_, HostBuffer>],
        launch: &LaunchConfig,
    ) -> Result<()> {
        let mut windows = Vec::with_capacity(args.len());
        let mut gathered = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                ArgBinding::Buffer { buffer, offset, len } => {
                    let (start, end) = self.window(buffer, *offset, *len)?;
                    gathered.push(HostArg::Buffer {
                        data: self.memory[buffer.0][start..end].to_vec(),
                        dirty: false,
                    });
                    windows.push(Some((buffer.0, start)));
                }
                ArgBinding::Scalar(value) => {
                    gathered.push(HostArg::Scalar(*value));
                    windows.push(None);
                }
                ArgBinding::Bytes(bytes) => {
                    gathered.push(HostArg::Bytes(bytes.to_vec()));
                    windows.push(None);
                }
            }
        }

        let mut host = HostArgs { args: gathered, launch: *launch };
        (kernel.run)(&mut host)?;

        for (arg, window) in host.args.into_iter().zip(windows) {
            if let (HostArg::Buffer { data, dirty: true }, Some((id, start))) = (arg, window) {
                self.memory[id][start..start + data.len()].copy_from_slice(&data);
            }
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kernels_fail_to_compile() {
        let mut device = CpuDevice::new();
        let err = device.compile("Bogus", "kernel void Bogus() {}", &[]).unwrap_err();
        assert!(matches!(err, NnError::Device(_)));
        assert!(device.compile("ReLU", "", &[]).is_ok());
    }

    #[test]
    fn alignment_must_be_word_multiple() {
        assert!(CpuDevice::with_alignment(6).is_err());
        assert!(CpuDevice::with_alignment(0).is_err());
        assert_eq!(CpuDevice::with_alignment(16).unwrap().alignment(), 16);
    }

    #[test]
    fn launch_writes_back_only_outputs() {
        let mut device = CpuDevice::new();
        let input = device.allocate(16, AccessMode::ReadOnly).unwrap();
        let output = device.allocate(16, AccessMode::ReadWrite).unwrap();
        device.write(&input, 0, bytemuck::cast_slice(&[-1.0f32, 2.0, -3.0, 4.0])).unwrap();

        let kernel = device.compile("ReLU", "", &[]).unwrap();
        let args = [
            ArgBinding::Buffer { buffer: &input, offset: 0, len: 16 },
            ArgBinding::Buffer { buffer: &output, offset: 0, len: 16 },
            ArgBinding::Scalar(Scalar::I32(4)),
        ];
        device.launch(&kernel, &args, &LaunchConfig::elementwise(4)).unwrap();

        let mut out = [0.0f32; 4];
        device.read(&output, 0, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [0.0, 2.0, 0.0, 4.0]);
        device.read(&input, 0, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [-1.0, 2.0, -3.0, 4.0]);
    }

    #[test]
    fn unaligned_transfers_are_rejected() {
        let mut device = CpuDevice::new();
        let buffer = device.allocate(16, AccessMode::ReadWrite).unwrap();
        assert!(device.write(&buffer, 2, &[0u8; 4]).is_err());
        assert!(matches!(device.write(&buffer, 12, &[0u8; 8]), Err(NnError::Range(_))));
    }
}
