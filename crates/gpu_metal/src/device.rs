use std::ffi::c_void;

use log::debug;
use metal::{CommandBuffer, CommandQueue, CompileOptions, ComputePipelineState, MTLCommandBufferStatus};
use nngraph_core::backend::{define_flags, AccessMode, ArgBinding};
use nngraph_core::{LaunchConfig, NnError, Result};

use crate::{dispatch_kernel, MetalBuffer};

pub struct MetalDevice {
    pub device: metal::Device,
    pub command_queue: CommandQueue,
    pending: Option<CommandBuffer>,
}

impl MetalDevice {
    /// Sub-buffer offsets stay valid for every argument address space.
    pub const ALIGNMENT: usize = 256;

    pub fn new() -> Result<Self> {
        let device = metal::Device::system_default()
            .ok_or_else(|| NnError::Device("No Metal device found".to_string()))?;
        let command_queue = device.new_command_queue();
        Ok(Self {
            device,
            command_queue,
            pending: None,
        })
    }

    fn command_buffer(&mut self) -> &CommandBuffer {
        let queue = &self.command_queue;
        self.pending
            .get_or_insert_with(|| queue.new_command_buffer().to_owned())
    }

    /// Host access must see every launch encoded so far.
    fn flush(&mut self) -> Result<()> {
        let Some(command_buffer) = self.pending.take() else {
            return Ok(());
        };
        command_buffer.commit();
        command_buffer.wait_until_completed();
        if command_buffer.status() == MTLCommandBufferStatus::Error {
            return Err(NnError::Device("Metal command buffer failed".to_string()));
        }
        Ok(())
    }
}

fn with_defines(source: &str, defines: &[String]) -> String {
    let mut out = String::new();
    for define in defines {
        match define.split_once('=') {
            Some((name, value)) => out.push_str(&format!("#define {name} {value}\n")),
            None => out.push_str(&format!("#define {define}\n")),
        }
    }
    out.push_str(source);
    out
}

impl nngraph_core::Device for MetalDevice {
    type Buffer = MetalBuffer;
    type Kernel = ComputePipelineState;

    fn name(&self) -> &str {
        self.device.name()
    }

    fn alignment(&self) -> usize {
        Self::ALIGNMENT
    }

    fn allocate(&mut self, bytes: usize, access: AccessMode) -> Result<MetalBuffer> {
        Ok(MetalBuffer::new(&self.device, bytes, access))
    }

    /// Uncached; the backend keeps one handle per (name, defines).
    fn compile(&mut self, name: &str, source: &str, defines: &[String]) -> Result<ComputePipelineState> {
        debug!("compiling Metal kernel {name} {}", define_flags(defines));
        let library = self
            .device
            .new_library_with_source(&with_defines(source, defines), &CompileOptions::new())
            .map_err(|e| NnError::Device(format!("Failed to compile Metal source for '{name}': {e}")))?;
        let function = library
            .get_function(name, None)
            .map_err(|e| NnError::Device(format!("Function '{name}' not found in library: {e}")))?;
        self.device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(|e| NnError::Device(format!("Failed to create pipeline for '{name}': {e}")))
    }

    fn write(&mut self, buffer: &MetalBuffer, offset: usize, data: &[u8]) -> Result<()> {
        self.flush()?;
        buffer.upload(offset, data)
    }

    fn read(&mut self, buffer: &MetalBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        self.flush()?;
        buffer.download(offset, out)
    }

    fn fill_zero(&mut self, buffer: &MetalBuffer, offset: usize, len: usize) -> Result<()> {
        self.flush()?;
        buffer.zero(offset, len)
    }

    fn launch(
        &mut self,
        kernel: &ComputePipelineState,
        args: &[ArgBinding<'_, MetalBuffer>],
        launch: &LaunchConfig,
    ) -> Result<()> {
        let encoder = self.command_buffer().new_compute_command_encoder();
        for (index, arg) in args.iter().enumerate() {
            let index = index as u64;
            match arg {
                ArgBinding::Buffer { buffer, offset, .. } => {
                    encoder.set_buffer(index, Some(&buffer.buffer), *offset as u64);
                }
                ArgBinding::Scalar(scalar) => {
                    let bytes = scalar.to_ne_bytes();
                    encoder.set_bytes(index, bytes.len() as u64, bytes.as_ptr() as *const c_void);
                }
                ArgBinding::Bytes(bytes) => {
                    encoder.set_bytes(index, bytes.len() as u64, bytes.as_ptr() as *const c_void);
                }
            }
        }
        dispatch_kernel(encoder, kernel, launch);
        encoder.end_encoding();
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.flush()
    }
}
