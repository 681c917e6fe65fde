use std::collections::HashMap;

use log::debug;

use crate::error::{NnError, Result};
use crate::kernels::KernelRegistry;
use crate::launch::LaunchConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// One of the three dispatch lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pass {
    Forward,
    Backward,
    Update,
}

impl Pass {
    pub const ALL: [Pass; 3] = [Pass::Forward, Pass::Backward, Pass::Update];

    pub fn name(&self) -> &'static str {
        match self {
            Pass::Forward => "forward",
            Pass::Backward => "backward",
            Pass::Update => "update",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(usize);

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle(usize);

/// A scalar kernel argument passed by value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    I32(i32),
    U32(u32),
    F32(f32),
}

impl Scalar {
    pub fn to_ne_bytes(&self) -> [u8; 4] {
        match self {
            Scalar::I32(v) => v.to_ne_bytes(),
            Scalar::U32(v) => v.to_ne_bytes(),
            Scalar::F32(v) => v.to_ne_bytes(),
        }
    }

    fn increment(&mut self) {
        match self {
            Scalar::I32(v) => *v = v.wrapping_add(1),
            Scalar::U32(v) => *v = v.wrapping_add(1),
            Scalar::F32(v) => *v += 1.0,
        }
    }
}

/// Argument bound to a recorded dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(Scalar),
    Blob(Vec<u8>),
}

impl KernelArg {
    /// Integer extent argument. Extents beyond `i32::MAX` cannot be expressed
    /// to a kernel and are clamped.
    pub fn int(value: usize) -> Self {
        KernelArg::Scalar(Scalar::I32(i32::try_from(value).unwrap_or(i32::MAX)))
    }

    pub fn signed(value: i64) -> Self {
        KernelArg::Scalar(Scalar::I32(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32))
    }

    pub fn float(value: f32) -> Self {
        KernelArg::Scalar(Scalar::F32(value))
    }
}

impl From<BufferHandle> for KernelArg {
    fn from(handle: BufferHandle) -> Self {
        KernelArg::Buffer(handle)
    }
}

impl From<f32> for KernelArg {
    fn from(value: f32) -> Self {
        KernelArg::float(value)
    }
}

impl From<usize> for KernelArg {
    fn from(value: usize) -> Self {
        KernelArg::int(value)
    }
}

impl From<i32> for KernelArg {
    fn from(value: i32) -> Self {
        KernelArg::Scalar(Scalar::I32(value))
    }
}

/// Argument as handed to a device at launch time, with buffer handles
/// resolved to the device allocation and byte window they refer to.
pub enum ArgBinding<'a, B> {
    Buffer { buffer: &'a B, offset: usize, len: usize },
    Scalar(Scalar),
    Bytes(&'a [u8]),
}

/// The device seam: raw allocation, program compilation, transfers and launches.
pub trait Device {
    type Buffer;
    type Kernel;

    fn name(&self) -> &str;

    /// Minimum byte alignment of a sub-buffer offset.
    fn alignment(&self) -> usize;

    fn allocate(&mut self, bytes: usize, access: AccessMode) -> Result<Self::Buffer>;

    /// Compiles `name` out of `source` with the given preprocessor defines
    /// (`NAME` or `NAME=VALUE`).
    fn compile(&mut self, name: &str, source: &str, defines: &[String]) -> Result<Self::Kernel>;

    fn write(&mut self, buffer: &Self::Buffer, offset: usize, data: &[u8]) -> Result<()>;

    fn read(&mut self, buffer: &Self::Buffer, offset: usize, out: &mut [u8]) -> Result<()>;

    fn fill_zero(&mut self, buffer: &Self::Buffer, offset: usize, len: usize) -> Result<()>;

    fn launch(
        &mut self,
        kernel: &Self::Kernel,
        args: &[ArgBinding<'_, Self::Buffer>],
        launch: &LaunchConfig,
    ) -> Result<()>;

    /// Blocks until every launched command has completed.
    fn synchronize(&mut self) -> Result<()>;
}

/// A kernel invocation described by name, resolved and compiled on submit.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRequest {
    pub kernel: String,
    pub defines: String,
    pub args: Vec<KernelArg>,
    pub launch: LaunchConfig,
    pub increment: Option<usize>,
}

impl DispatchRequest {
    pub fn new(kernel: &str, args: Vec<KernelArg>, launch: LaunchConfig) -> Self {
        Self {
            kernel: kernel.to_string(),
            defines: String::new(),
            args,
            launch,
            increment: None,
        }
    }

    pub fn with_defines(mut self, defines: &str) -> Self {
        self.defines = defines.to_string();
        self
    }

    /// Bumps the scalar at `arg` by one after every run.
    pub fn incrementing(mut self, arg: usize) -> Self {
        self.increment = Some(arg);
        self
    }
}

#[derive(Clone, Debug)]
struct Dispatch {
    kernel: KernelHandle,
    args: Vec<KernelArg>,
    launch: LaunchConfig,
    increment: Option<usize>,
}

enum Storage<B> {
    Base { buffer: B, slot_bytes: usize },
    Sub { base: usize, offset: usize },
}

struct BufferRecord<B> {
    storage: Storage<B>,
    bytes: usize,
    access: AccessMode,
}

struct CompiledKernel<K> {
    name: String,
    kernel: K,
}

/// Splits a whitespace separated define string into its normalised list.
pub fn parse_defines(defines: &str) -> Vec<String> {
    defines.split_whitespace().map(str::to_string).collect()
}

/// Renders defines as compiler flags, `-D NAME` per entry.
pub fn define_flags(defines: &[String]) -> String {
    defines
        .iter()
        .map(|d| format!("-D {d}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Owns the device, the compiled-kernel cache, every buffer and the three
/// ordered dispatch lists.
pub struct Backend<D: Device> {
    device: D,
    registry: KernelRegistry,
    kernels: Vec<CompiledKernel<D::Kernel>>,
    kernel_cache: HashMap<(String, Vec<String>), KernelHandle>,
    buffers: Vec<BufferRecord<D::Buffer>>,
    forward: Vec<Dispatch>,
    backward: Vec<Dispatch>,
    update: Vec<Dispatch>,
    validate: bool,
}

impl<D: Device> Backend<D> {
    pub fn new(device: D, registry: KernelRegistry) -> Self {
        Self {
            device,
            registry,
            kernels: Vec::new(),
            kernel_cache: HashMap::new(),
            buffers: Vec::new(),
            forward: Vec::new(),
            backward: Vec::new(),
            update: Vec::new(),
            validate: true,
        }
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn set_validation(&mut self, validate: bool) {
        self.validate = validate;
    }

    pub fn validation(&self) -> bool {
        self.validate
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn alignment(&self) -> usize {
        self.device.alignment().max(1)
    }

    /// Bytes one slot occupies once padded to the device alignment.
    pub fn aligned_slot(&self, bytes: usize) -> usize {
        let align = self.alignment();
        align * bytes.div_ceil(align)
    }

    pub fn get_or_compile_kernel(&mut self, name: &str, defines: &str) -> Result<KernelHandle> {
        let defines = parse_defines(defines);
        let key = (name.to_string(), defines);
        if let Some(handle) = self.kernel_cache.get(&key) {
            return Ok(*handle);
        }

        let source = self
            .registry
            .source(name)
            .ok_or_else(|| NnError::ResourceNotFound(format!("kernel `{name}` has no registered source")))?;
        debug!("compiling kernel `{}` [{}] on {}", name, define_flags(&key.1), self.device.name());
        let kernel = self.device.compile(name, source, &key.1)?;

        let handle = KernelHandle(self.kernels.len());
        self.kernels.push(CompiledKernel { name: name.to_string(), kernel });
        self.kernel_cache.insert(key, handle);
        Ok(handle)
    }

    pub fn kernel_name(&self, handle: KernelHandle) -> Option<&str> {
        self.kernels.get(handle.0).map(|k| k.name.as_str())
    }

    pub fn compiled_kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// Allocates `count` slots of `bytes`, each padded to the device alignment.
    pub fn create_buffer(&mut self, bytes: usize, access: AccessMode, count: usize) -> Result<BufferHandle> {
        let slot_bytes = self.aligned_slot(bytes.max(1));
        let total = slot_bytes * count.max(1);
        let buffer = self.device.allocate(total, access)?;
        let handle = BufferHandle(self.buffers.len());
        self.buffers.push(BufferRecord {
            storage: Storage::Base { buffer, slot_bytes },
            bytes: total,
            access,
        });
        Ok(handle)
    }

    /// A view of slot `index` inside `base`'s padded layout.
    pub fn create_sub_buffer(
        &mut self,
        base: BufferHandle,
        bytes: usize,
        access: AccessMode,
        index: usize,
    ) -> Result<BufferHandle> {
        let record = self.record(base)?;
        let Storage::Base { slot_bytes, .. } = record.storage else {
            return Err(NnError::Device(format!("buffer {} is already a sub-buffer", base.0)));
        };
        let offset = slot_bytes * index;
        if bytes > slot_bytes || offset + bytes > record.bytes {
            return Err(NnError::Range(format!(
                "sub-buffer {} of {} bytes does not fit buffer {} ({} bytes, slot {})",
                index, bytes, base.0, record.bytes, slot_bytes
            )));
        }
        let handle = BufferHandle(self.buffers.len());
        self.buffers.push(BufferRecord {
            storage: Storage::Sub { base: base.0, offset },
            bytes,
            access,
        });
        Ok(handle)
    }

    fn record(&self, handle: BufferHandle) -> Result<&BufferRecord<D::Buffer>> {
        self.buffers
            .get(handle.0)
            .ok_or_else(|| NnError::Range(format!("unknown buffer handle {}", handle.0)))
    }

    /// Byte offset of a handle inside its base allocation.
    pub fn buffer_offset(&self, handle: BufferHandle) -> Result<usize> {
        match self.record(handle)?.storage {
            Storage::Base { .. } => Ok(0),
            Storage::Sub { offset, .. } => Ok(offset),
        }
    }

    /// Usable bytes of a handle.
    pub fn buffer_len(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.record(handle)?.bytes)
    }

    pub fn buffer_access(&self, handle: BufferHandle) -> Result<AccessMode> {
        Ok(self.record(handle)?.access)
    }

    fn check_range(&self, handle: BufferHandle, offset: usize, len: usize) -> Result<()> {
        let bytes = self.record(handle)?.bytes;
        if offset.checked_add(len).map_or(true, |end| end > bytes) {
            return Err(NnError::Range(format!(
                "{} bytes at offset {} exceed buffer {} of {} bytes",
                len, offset, handle.0, bytes
            )));
        }
        Ok(())
    }

    pub fn write_buffer(&mut self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        if self.validate {
            self.check_range(handle, offset, data.len())?;
        }
        let (buffer, base_offset, _) = resolve_in(&self.buffers, handle)?;
        self.device.write(buffer, base_offset + offset, data)
    }

    pub fn read_buffer(&mut self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        if self.validate {
            self.check_range(handle, offset, out.len())?;
        }
        let (buffer, base_offset, _) = resolve_in(&self.buffers, handle)?;
        self.device.read(buffer, base_offset + offset, out)
    }

    pub fn zero_buffer(&mut self, handle: BufferHandle, offset: usize, bytes: usize) -> Result<()> {
        if self.validate {
            self.check_range(handle, offset, bytes)?;
        }
        let (buffer, base_offset, _) = resolve_in(&self.buffers, handle)?;
        self.device.fill_zero(buffer, base_offset + offset, bytes)
    }

    pub fn write_f32(&mut self, handle: BufferHandle, offset: usize, data: &[f32]) -> Result<()> {
        self.write_buffer(handle, offset, bytemuck::cast_slice(data))
    }

    pub fn read_f32(&mut self, handle: BufferHandle, offset: usize, out: &mut [f32]) -> Result<()> {
        self.read_buffer(handle, offset, bytemuck::cast_slice_mut(out))
    }

    fn validate_args(&self, kernel: KernelHandle, args: &[KernelArg], launch: &LaunchConfig) -> Result<()> {
        if kernel.0 >= self.kernels.len() {
            return Err(NnError::ResourceNotFound(format!("unknown kernel handle {}", kernel.0)));
        }
        for arg in args {
            if let KernelArg::Buffer(handle) = arg {
                self.record(*handle)?;
            }
        }
        for axis in 0..3 {
            if launch.local[axis] == 0 || launch.global[axis] % launch.local[axis] != 0 {
                return Err(NnError::Device(format!(
                    "global size {:?} is not a multiple of local size {:?}",
                    launch.global, launch.local
                )));
            }
        }
        Ok(())
    }

    fn list_mut(&mut self, pass: Pass) -> &mut Vec<Dispatch> {
        match pass {
            Pass::Forward => &mut self.forward,
            Pass::Backward => &mut self.backward,
            Pass::Update => &mut self.update,
        }
    }

    fn push(&mut self, pass: Pass, dispatch: Dispatch) -> Result<usize> {
        if self.validate {
            self.validate_args(dispatch.kernel, &dispatch.args, &dispatch.launch)?;
        }
        let list = self.list_mut(pass);
        list.push(dispatch);
        Ok(list.len() - 1)
    }

    /// Appends a dispatch to `pass`; returns its index in that list.
    pub fn enqueue(
        &mut self,
        kernel: KernelHandle,
        args: Vec<KernelArg>,
        launch: LaunchConfig,
        pass: Pass,
    ) -> Result<usize> {
        self.push(pass, Dispatch { kernel, args, launch, increment: None })
    }

    /// Like [`Backend::enqueue`], but the scalar at `arg` is bumped by one
    /// after every run of the dispatch.
    pub fn enqueue_incrementing(
        &mut self,
        kernel: KernelHandle,
        args: Vec<KernelArg>,
        launch: LaunchConfig,
        pass: Pass,
        arg: usize,
    ) -> Result<usize> {
        if !matches!(args.get(arg), Some(KernelArg::Scalar(_))) {
            return Err(NnError::Range(format!("argument {arg} is not a scalar and cannot be incremented")));
        }
        self.push(pass, Dispatch { kernel, args, launch, increment: Some(arg) })
    }

    /// Compiles (or fetches) the named kernel and appends the dispatch.
    pub fn submit(&mut self, request: DispatchRequest, pass: Pass) -> Result<usize> {
        let kernel = self.get_or_compile_kernel(&request.kernel, &request.defines)?;
        match request.increment {
            Some(arg) => self.enqueue_incrementing(kernel, request.args, request.launch, pass, arg),
            None => self.enqueue(kernel, request.args, request.launch, pass),
        }
    }

    pub fn dispatch_count(&self, pass: Pass) -> usize {
        match pass {
            Pass::Forward => self.forward.len(),
            Pass::Backward => self.backward.len(),
            Pass::Update => self.update.len(),
        }
    }

    /// Kernel names of a pass in append order.
    pub fn dispatch_names(&self, pass: Pass) -> Vec<&str> {
        let list = match pass {
            Pass::Forward => &self.forward,
            Pass::Backward => &self.backward,
            Pass::Update => &self.update,
        };
        list.iter()
            .filter_map(|d| self.kernels.get(d.kernel.0).map(|k| k.name.as_str()))
            .collect()
    }

    /// Plays a pass: forward and update in append order, backward strictly
    /// reversed. Blocks until the device is done.
    pub fn run(&mut self, pass: Pass) -> Result<()> {
        let Self { device, buffers, kernels, forward, backward, update, .. } = self;
        match pass {
            Pass::Forward => play(device, buffers, kernels, forward.iter_mut())?,
            Pass::Backward => play(device, buffers, kernels, backward.iter_mut().rev())?,
            Pass::Update => play(device, buffers, kernels, update.iter_mut())?,
        }
        device.synchronize()
    }

    /// Drops every recorded dispatch. Compiled kernels and buffers survive.
    pub fn clear_dispatches(&mut self) {
        self.forward.clear();
        self.backward.clear();
        self.update.clear();
    }

    #[cfg(test)]
    pub(crate) fn resolved(&self, handle: BufferHandle) -> Result<usize> {
        resolve_in(&self.buffers, handle).map(|(_, offset, _)| offset)
    }
}

fn resolve_in<B>(buffers: &[BufferRecord<B>], handle: BufferHandle) -> Result<(&B, usize, usize)> {
    let record = buffers
        .get(handle.0)
        .ok_or_else(|| NnError::Range(format!("unknown buffer handle {}", handle.0)))?;
    match &record.storage {
        Storage::Base { buffer, .. } => Ok((buffer, 0, record.bytes)),
        Storage::Sub { base, offset } => match buffers.get(*base).map(|b| &b.storage) {
            Some(Storage::Base { buffer, .. }) => Ok((buffer, *offset, record.bytes)),
            _ => Err(NnError::Range(format!("sub-buffer {} has no base allocation", handle.0))),
        },
    }
}

fn play<'a, D: Device>(
    device: &mut D,
    buffers: &[BufferRecord<D::Buffer>],
    kernels: &[CompiledKernel<D::Kernel>],
    dispatches: impl Iterator<Item = &'a mut Dispatch>,
) -> Result<()> {
    for dispatch in dispatches {
        let compiled = kernels
            .get(dispatch.kernel.0)
            .ok_or_else(|| NnError::ResourceNotFound(format!("unknown kernel handle {}", dispatch.kernel.0)))?;

        {
            let mut bindings = Vec::with_capacity(dispatch.args.len());
            for arg in &dispatch.args {
                bindings.push(match arg {
                    KernelArg::Buffer(handle) => {
                        let (buffer, offset, len) = resolve_in(buffers, *handle)?;
                        ArgBinding::Buffer { buffer, offset, len }
                    }
                    KernelArg::Scalar(value) => ArgBinding::Scalar(*value),
                    KernelArg::Blob(bytes) => ArgBinding::Bytes(bytes.as_slice()),
                });
            }

            device
                .launch(&compiled.kernel, &bindings, &dispatch.launch)
                .map_err(|e| match e {
                    NnError::Device(msg) => NnError::Device(format!("{}: {}", compiled.name, msg)),
                    other => other,
                })?;
        }

        if let Some(index) = dispatch.increment {
            if let Some(KernelArg::Scalar(value)) = dispatch.args.get_mut(index) {
                value.increment();
            }
        }
    }
    Ok(())
}
