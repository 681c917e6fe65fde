//! Device storage for one logical value of the graph: a forward and a
//! backward allocation carved into one aligned slot per timestep.

use log::debug;

use crate::backend::{AccessMode, Backend, BufferHandle, Device};
use crate::error::{NnError, Result};
use crate::nn::ops::OpId;
use crate::shape::Shape;

/// Index of a tensor inside its network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl TensorId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorKind {
    /// Caller-written data; forward storage is read-only to kernels.
    Input,
    /// Operator output, one slot pair per timestep.
    Intermediate,
    /// Trainable weights: one slot regardless of sequence length, batch
    /// independent, plus optimizer auxiliary buffers.
    Parameter,
    /// Like `Intermediate` with one extra slot holding the state before time 0.
    RecurrentState,
    /// Transient forward-only buffer shared between operators.
    Scratch,
}

impl TensorKind {
    fn slot_count(&self, seq: usize) -> usize {
        match self {
            TensorKind::Parameter | TensorKind::Scratch => 1,
            TensorKind::RecurrentState => seq + 1,
            TensorKind::Input | TensorKind::Intermediate => seq,
        }
    }

    fn has_backward(&self) -> bool {
        !matches!(self, TensorKind::Scratch)
    }

    fn follows_batch(&self) -> bool {
        !matches!(self, TensorKind::Parameter | TensorKind::Scratch)
    }

    fn forward_access(&self) -> AccessMode {
        match self {
            TensorKind::Input => AccessMode::ReadOnly,
            _ => AccessMode::ReadWrite,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Storage {
    base: Option<BufferHandle>,
    slots: Vec<BufferHandle>,
}

impl Storage {
    fn allocate<D: Device>(
        backend: &mut Backend<D>,
        bytes: usize,
        access: AccessMode,
        count: usize,
    ) -> Result<Self> {
        let base = backend.create_buffer(bytes, access, count)?;
        let slots = (0..count)
            .map(|i| backend.create_sub_buffer(base, bytes, access, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { base: Some(base), slots })
    }

    fn zero<D: Device>(&self, backend: &mut Backend<D>) -> Result<()> {
        if let Some(base) = self.base {
            let bytes = backend.buffer_len(base)?;
            backend.zero_buffer(base, 0, bytes)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Tensor {
    kind: TensorKind,
    shape: Shape,
    seq: usize,
    time_offset: usize,
    cursor: usize,
    name: Option<String>,
    producer: Option<OpId>,
    consumers: Vec<OpId>,
    forward: Storage,
    backward: Storage,
    aux: Vec<BufferHandle>,
}

impl Tensor {
    pub fn new(kind: TensorKind, shape: Shape, seq: usize) -> Self {
        Self {
            kind,
            shape,
            seq: seq.max(1),
            time_offset: 0,
            cursor: 0,
            name: None,
            producer: None,
            consumers: Vec::new(),
            forward: Storage::default(),
            backward: Storage::default(),
            aux: Vec::new(),
        }
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn time_offset(&self) -> usize {
        self.time_offset
    }

    pub(crate) fn set_time_offset(&mut self, offset: usize) {
        self.time_offset = offset;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn consumers(&self) -> &[OpId] {
        &self.consumers
    }

    /// The first writer stays the producer; later explicit-target writers
    /// (recurrent updates) do not replace it.
    pub(crate) fn set_producer(&mut self, op: OpId) {
        if self.producer.is_none() {
            self.producer = Some(op);
        }
    }

    pub(crate) fn add_consumer(&mut self, op: OpId) {
        if !self.consumers.contains(&op) {
            self.consumers.push(op);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.kind.slot_count(self.seq)
    }

    pub fn is_instantiated(&self) -> bool {
        self.forward.base.is_some()
    }

    pub fn aux_count(&self) -> usize {
        self.aux.len()
    }

    /// Propagates the batch size into `w`; parameters and scratch keep theirs.
    pub fn set_batch_size(&mut self, batch: usize) {
        if self.kind.follows_batch() {
            self.shape.w = batch.max(1);
        }
    }

    /// Scratch tensors only ever grow.
    pub(crate) fn grow_elements(&mut self, elements: usize) {
        if elements > self.shape.elements() {
            self.shape = Shape::d1(elements);
        }
    }

    /// Creates the device buffers. Parameters also get `aux_count` optimizer
    /// buffers of their own size.
    pub fn instantiate<D: Device>(&mut self, backend: &mut Backend<D>, aux_count: usize) -> Result<()> {
        if self.is_instantiated() {
            return Err(NnError::UsageSequence("tensor storage instantiated twice".to_string()));
        }
        let bytes = self.shape.bytes();
        let slots = self.slot_count();
        self.forward = Storage::allocate(backend, bytes, self.kind.forward_access(), slots)?;
        if self.kind.has_backward() {
            self.backward = Storage::allocate(backend, bytes, AccessMode::ReadWrite, slots)?;
        }
        if self.kind == TensorKind::Parameter {
            self.aux = (0..aux_count)
                .map(|_| backend.create_buffer(bytes, AccessMode::ReadWrite, 1))
                .collect::<Result<Vec<_>>>()?;
        }
        debug!(
            "instantiated {:?} tensor {} x {} slots{}",
            self.kind,
            self.shape,
            slots,
            if self.aux.is_empty() { String::new() } else { format!(" + {} aux", self.aux.len()) }
        );
        Ok(())
    }

    fn slot(&self, storage: &Storage, index: usize, what: &str) -> Result<BufferHandle> {
        if storage.base.is_none() {
            return Err(NnError::not_initialized());
        }
        storage.slots.get(index).copied().ok_or_else(|| {
            NnError::Range(format!("{what} slot {index} out of {} slots", storage.slots.len()))
        })
    }

    fn current_slot(&self) -> usize {
        match self.kind {
            TensorKind::Parameter | TensorKind::Scratch => 0,
            _ => self.cursor,
        }
    }

    fn shifted_slot(&self, shift: i64) -> usize {
        let count = self.slot_count() as i64;
        (self.current_slot() as i64 + shift).rem_euclid(count) as usize
    }

    /// Forward storage at the cursor.
    pub fn forward_buffer(&self) -> Result<BufferHandle> {
        self.slot(&self.forward, self.current_slot(), "forward")
    }

    /// Forward storage `shift` timesteps away from the cursor, wrapping over
    /// the tensor's slots.
    pub fn forward_buffer_shifted(&self, shift: i64) -> Result<BufferHandle> {
        self.slot(&self.forward, self.shifted_slot(shift), "forward")
    }

    /// Forward storage of timestep `index`.
    ///
    /// For parameters `index` selects an optimizer auxiliary buffer instead:
    /// their single forward slot is reached through [`Tensor::forward_buffer`],
    /// and optimizers ask for their moment buffers by index here.
    pub fn forward_buffer_at(&self, index: usize) -> Result<BufferHandle> {
        if self.kind == TensorKind::Parameter {
            return self.aux.get(index).copied().ok_or_else(|| {
                NnError::Range(format!("auxiliary buffer {index} out of {}", self.aux.len()))
            });
        }
        self.slot(&self.forward, index, "forward")
    }

    pub fn backward_buffer(&self) -> Result<BufferHandle> {
        self.require_backward()?;
        self.slot(&self.backward, self.current_slot(), "backward")
    }

    pub fn backward_buffer_shifted(&self, shift: i64) -> Result<BufferHandle> {
        self.require_backward()?;
        self.slot(&self.backward, self.shifted_slot(shift), "backward")
    }

    pub fn backward_buffer_at(&self, index: usize) -> Result<BufferHandle> {
        self.require_backward()?;
        self.slot(&self.backward, index, "backward")
    }

    fn require_backward(&self) -> Result<()> {
        if self.kind.has_backward() {
            Ok(())
        } else {
            Err(NnError::Graph("scratch tensors have no backward storage".to_string()))
        }
    }

    /// Per-batch reset: zeroes backward storage; recurrent state also
    /// loses its forward history; scratch is left alone.
    pub fn clear<D: Device>(&self, backend: &mut Backend<D>) -> Result<()> {
        match self.kind {
            TensorKind::Scratch => Ok(()),
            TensorKind::RecurrentState => {
                self.forward.zero(backend)?;
                self.backward.zero(backend)
            }
            _ => self.backward.zero(backend),
        }
    }

    /// Zeroes every slot of forward and backward storage.
    pub fn clear_all<D: Device>(&self, backend: &mut Backend<D>) -> Result<()> {
        self.forward.zero(backend)?;
        self.backward.zero(backend)
    }

    /// Moves the cursor one timestep on, wrapping at the sequence length.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.seq;
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }
}
