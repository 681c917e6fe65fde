//! The network: graph construction, the staged compiler that turns the graph
//! into the backend's three dispatch lists, and the runtime surface.

use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::{Backend, Device, Pass};
use crate::config::NetworkConfig;
use crate::error::{NnError, Result};
use crate::nn::init::{InitOp, WeightInit};
use crate::nn::ops::{OpId, Operator};
use crate::nn::optim::Optimizer;
use crate::profiler::PassProfiler;
use crate::shape::Shape;
use crate::snapshot;
use crate::tensor::{Tensor, TensorId, TensorKind};

struct Node {
    op: Operator,
    inputs: Vec<TensorId>,
    output: TensorId,
    scratch: Vec<TensorId>,
    time_offset: usize,
    forward: Vec<usize>,
    backward: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Building,
    Compiled,
    Failed,
}

pub struct Network<D: Device> {
    backend: Backend<D>,
    config: NetworkConfig,
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    scratch: Vec<TensorId>,
    optimizer: Option<Box<dyn Optimizer>>,
    inits: Vec<InitOp>,
    max_seq: usize,
    batch: usize,
    staging: Vec<f32>,
    stage: Stage,
    profiler: Option<PassProfiler>,
    rng: StdRng,
}

impl<D: Device> Network<D> {
    pub fn new(mut backend: Backend<D>, config: NetworkConfig) -> Self {
        backend.set_validation(config.validate);
        Self {
            backend,
            config,
            tensors: Vec::new(),
            nodes: Vec::new(),
            scratch: Vec::new(),
            optimizer: None,
            inits: Vec::new(),
            max_seq: 1,
            batch: 1,
            staging: Vec::new(),
            stage: Stage::Building,
            profiler: config.profile.then(PassProfiler::new),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend<D> {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend<D> {
        &mut self.backend
    }

    pub fn profiler(&self) -> Option<&PassProfiler> {
        self.profiler.as_ref()
    }

    pub fn is_compiled(&self) -> bool {
        self.stage == Stage::Compiled
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Longest sequence in the graph, i.e. the number of unroll steps.
    pub fn max_sequence(&self) -> usize {
        self.max_seq
    }

    /// Largest per-tensor element count, tracked at compile time.
    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    fn require_building(&self) -> Result<()> {
        match self.stage {
            Stage::Building => Ok(()),
            _ => Err(NnError::UsageSequence("graph is already compiled".to_string())),
        }
    }

    fn require_compiled(&self) -> Result<()> {
        match self.stage {
            Stage::Compiled => Ok(()),
            _ => Err(NnError::not_initialized()),
        }
    }

    pub fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors
            .get(id.0)
            .ok_or_else(|| NnError::Graph(format!("unknown tensor {}", id.0)))
    }

    fn tensor_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(id.0)
            .ok_or_else(|| NnError::Graph(format!("unknown tensor {}", id.0)))
    }

    pub fn shape(&self, id: TensorId) -> Result<Shape> {
        self.tensor(id).map(Tensor::shape)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn operator_count(&self) -> usize {
        self.nodes.len()
    }

    /// Scratch tensors created by the last compile, in slot order.
    pub fn scratch_tensors(&self) -> &[TensorId] {
        &self.scratch
    }

    /// Indices into the forward and backward dispatch lists that `op` emitted.
    pub fn operator_dispatches(&self, op: OpId) -> Result<(&[usize], &[usize])> {
        let node = self
            .nodes
            .get(op.0)
            .ok_or_else(|| NnError::Graph(format!("unknown operator {}", op.0)))?;
        Ok((&node.forward, &node.backward))
    }

    fn create(&mut self, kind: TensorKind, shape: Shape, seq: usize) -> Result<TensorId> {
        self.require_building()?;
        if shape.elements() == 0 {
            return Err(NnError::Graph(format!("tensor shape {shape} has an empty dimension")));
        }
        let tensor = Tensor::new(kind, shape, seq);
        self.max_seq = self.max_seq.max(tensor.seq());
        self.tensors.push(tensor);
        Ok(TensorId(self.tensors.len() - 1))
    }

    pub fn create_input(&mut self, shape: Shape, seq: usize) -> Result<TensorId> {
        self.create(TensorKind::Input, shape, seq)
    }

    pub fn create_state(&mut self, shape: Shape, seq: usize) -> Result<TensorId> {
        self.create(TensorKind::RecurrentState, shape, seq)
    }

    pub fn create_parameter(&mut self, shape: Shape, seq: usize) -> Result<TensorId> {
        self.create(TensorKind::Parameter, shape, seq)
    }

    /// Name used for the tensor's snapshot record.
    pub fn name_tensor(&mut self, id: TensorId, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('\n') {
            return Err(NnError::Graph(format!("tensor name {name:?} must be one non-empty line")));
        }
        self.tensor_mut(id)?.set_name(name);
        Ok(())
    }

    fn bind(&self, op: &Operator, inputs: &[TensorId]) -> Result<Shape> {
        let shapes = inputs
            .iter()
            .map(|id| self.shape(*id))
            .collect::<Result<Vec<_>>>()?;
        op.output_shape(&shapes)
    }

    fn link(&mut self, op: Operator, inputs: &[TensorId], output: TensorId, time_offset: usize) -> Result<OpId> {
        let id = OpId(self.nodes.len());
        for input in inputs {
            self.tensor_mut(*input)?.add_consumer(id);
        }
        self.tensor_mut(output)?.set_producer(id);
        debug!("operator {} `{}` -> tensor {}", id.0, op.name(), output.0);
        self.nodes.push(Node {
            op,
            inputs: inputs.to_vec(),
            output,
            scratch: Vec::new(),
            time_offset,
            forward: Vec::new(),
            backward: Vec::new(),
        });
        Ok(id)
    }

    /// Adds `op` over `inputs` with a fresh output tensor. The operator first
    /// runs at unroll step `time_offset` and then on every later step of the
    /// output's sequence.
    pub fn add_operator(&mut self, op: Operator, inputs: &[TensorId], time_offset: usize) -> Result<TensorId> {
        self.require_building()?;
        let shape = self.bind(&op, inputs)?;
        let seq = {
            let bound = inputs.iter().map(|id| self.tensor(*id)).collect::<Result<Vec<_>>>()?;
            op.sequence_length(&bound)
        };
        let output = self.create(TensorKind::Intermediate, shape, seq)?;
        self.tensor_mut(output)?.set_time_offset(time_offset);
        self.link(op, inputs, output, time_offset)?;
        Ok(output)
    }

    /// Adds `op` writing into an existing tensor. Recurrent units use this to
    /// write their new state into the state they read. `result` takes on
    /// `time_offset` the same way a fresh output would.
    ///
    /// Within an unroll step operators run in registration order, so a write
    /// into a later timestep of `result` must be registered after every read
    /// of its current timestep.
    pub fn add_operator_into(
        &mut self,
        op: Operator,
        inputs: &[TensorId],
        result: TensorId,
        time_offset: usize,
    ) -> Result<TensorId> {
        self.require_building()?;
        let shape = self.bind(&op, inputs)?;
        let target = self.shape(result)?;
        if shape.row_elements() != target.row_elements() {
            return Err(NnError::Graph(format!(
                "{} produces {shape} but target tensor is {target}",
                op.name()
            )));
        }
        self.tensor_mut(result)?.set_time_offset(time_offset);
        self.link(op, inputs, result, time_offset)?;
        Ok(result)
    }

    /// Sets the update rule every parameter uses.
    pub fn set_optimizer(&mut self, optimizer: Box<dyn Optimizer>) -> Result<()> {
        self.require_building()?;
        self.optimizer = Some(optimizer);
        Ok(())
    }

    pub fn add_weight_initializer(&mut self, init: InitOp) -> Result<()> {
        self.require_building()?;
        let kind = self.tensor(init.target)?.kind();
        if kind != TensorKind::Parameter {
            return Err(NnError::Graph(format!(
                "weight initializer bound to {kind:?} tensor {}",
                init.target.0
            )));
        }
        self.inits.push(init);
        Ok(())
    }

    pub fn init_weight(&mut self, target: TensorId, init: WeightInit) -> Result<()> {
        self.add_weight_initializer(InitOp { target, init })
    }

    /// Compiles the graph for `batch` rows. Must succeed before anything runs
    /// and can only be attempted once.
    pub fn compile(&mut self, batch: usize) -> Result<()> {
        self.require_building()?;
        let result = self.compile_stages(batch.max(1));
        self.stage = match result {
            Ok(()) => Stage::Compiled,
            Err(_) => Stage::Failed,
        };
        result
    }

    fn compile_stages(&mut self, batch: usize) -> Result<()> {
        // 1. batch size and staging footprint; loss and metric outputs stay (1)
        self.batch = batch;
        let scalars: Vec<usize> = self
            .nodes
            .iter()
            .filter(|node| node.op.reduces_batch())
            .map(|node| node.output.0)
            .collect();
        let mut largest = 0;
        for (index, tensor) in self.tensors.iter_mut().enumerate() {
            if !scalars.contains(&index) {
                tensor.set_batch_size(batch);
            }
            largest = largest.max(tensor.shape().elements());
        }
        self.staging = vec![0.0; largest];
        info!(
            "compiling {} operators over {} tensors, batch {}, {} unroll steps",
            self.nodes.len(),
            self.tensors.len(),
            batch,
            self.max_seq
        );

        // 2. scratch planning: slot k is as large as the largest request for it
        let mut slot_sizes: Vec<usize> = Vec::new();
        let mut requests = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let shapes = node
                .inputs
                .iter()
                .map(|id| self.shape(*id))
                .collect::<Result<Vec<_>>>()?;
            let wanted = node.op.scratch_elements(&shapes);
            for (k, elements) in wanted.iter().enumerate() {
                match slot_sizes.get_mut(k) {
                    Some(size) => *size = (*size).max(*elements),
                    None => slot_sizes.push(*elements),
                }
            }
            requests.push(wanted.len());
        }
        for elements in &slot_sizes {
            let mut scratch = Tensor::new(TensorKind::Scratch, Shape::d1(1), 1);
            scratch.grow_elements(*elements);
            self.tensors.push(scratch);
            self.scratch.push(TensorId(self.tensors.len() - 1));
        }
        for (node, count) in self.nodes.iter_mut().zip(requests) {
            node.scratch = self.scratch[..count].to_vec();
        }
        info!("scratch slots: {:?} elements", slot_sizes);

        // 3. device storage
        let aux = self.optimizer.as_ref().map_or(0, |o| o.aux_buffer_count());
        for tensor in &mut self.tensors {
            tensor.instantiate(&mut self.backend, aux)?;
        }

        // 4. operator instantiation, one pass over the nodes per unroll step
        for step in 0..self.max_seq {
            for index in 0..self.nodes.len() {
                self.emit_node(index, step)?;
            }
            for tensor in &mut self.tensors {
                tensor.advance();
            }
        }
        for tensor in &mut self.tensors {
            tensor.reset_cursor();
        }

        // 5. optimizer
        if let Some(optimizer) = &self.optimizer {
            for tensor in self.tensors.iter().filter(|t| t.kind() == TensorKind::Parameter) {
                for request in optimizer.update_dispatches(tensor)? {
                    self.backend.submit(request, Pass::Update)?;
                }
            }
        }

        // 6. clear
        for tensor in &self.tensors {
            tensor.clear_all(&mut self.backend)?;
        }

        // 7. weight init
        for init in &self.inits {
            let tensor = &self.tensors[init.target.0];
            let values = init.init.sample(tensor.shape(), &mut self.rng);
            self.backend.write_f32(tensor.forward_buffer()?, 0, &values)?;
        }
        self.backend.device_mut().synchronize()?;

        info!(
            "compiled: {} forward, {} backward, {} update dispatches, {} kernels",
            self.backend.dispatch_count(Pass::Forward),
            self.backend.dispatch_count(Pass::Backward),
            self.backend.dispatch_count(Pass::Update),
            self.backend.compiled_kernel_count()
        );
        Ok(())
    }

    fn emit_node(&mut self, index: usize, step: usize) -> Result<()> {
        let node = &self.nodes[index];
        let output = &self.tensors[node.output.0];
        if output.seq() <= step || node.time_offset > step {
            return Ok(());
        }
        let inputs: Vec<&Tensor> = node.inputs.iter().map(|id| &self.tensors[id.0]).collect();
        let scratch: Vec<&Tensor> = node.scratch.iter().map(|id| &self.tensors[id.0]).collect();
        let emission = node.op.emit(&inputs, output, &scratch)?;

        let mut forward = Vec::with_capacity(emission.forward.len());
        for request in emission.forward {
            forward.push(self.backend.submit(request, Pass::Forward)?);
        }
        let mut backward = Vec::with_capacity(emission.backward.len());
        for request in emission.backward {
            backward.push(self.backend.submit(request, Pass::Backward)?);
        }
        let node = &mut self.nodes[index];
        node.forward.extend(forward);
        node.backward.extend(backward);
        Ok(())
    }

    /// Plays one pass and waits for the device.
    pub fn run(&mut self, pass: Pass) -> Result<()> {
        self.require_compiled()?;
        let start = Instant::now();
        self.backend.run(pass)?;
        if let Some(profiler) = &mut self.profiler {
            profiler.record(pass, start.elapsed());
        }
        Ok(())
    }

    pub fn forward(&mut self) -> Result<()> {
        self.run(Pass::Forward)
    }

    pub fn backward(&mut self) -> Result<()> {
        self.run(Pass::Backward)
    }

    pub fn update(&mut self) -> Result<()> {
        self.run(Pass::Update)
    }

    /// Applies the update pass, then resets per-batch storage.
    pub fn batch_done(&mut self) -> Result<()> {
        self.update()?;
        self.clear_buffers()
    }

    /// Zeroes backward storage (and recurrent forward state) of every tensor.
    pub fn clear_buffers(&mut self) -> Result<()> {
        self.require_compiled()?;
        for tensor in &self.tensors {
            tensor.clear(&mut self.backend)?;
        }
        Ok(())
    }

    /// Forward slot `t`; parameters only have slot 0.
    fn forward_slot(tensor: &Tensor, t: usize) -> Result<crate::backend::BufferHandle> {
        if tensor.kind() == TensorKind::Parameter {
            return match t {
                0 => tensor.forward_buffer(),
                _ => Err(NnError::Range(format!("parameters have a single timestep, asked for {t}"))),
            };
        }
        tensor.forward_buffer_at(t)
    }

    pub fn write_tensor(&mut self, id: TensorId, t: usize, data: &[f32]) -> Result<()> {
        self.require_compiled()?;
        let handle = Self::forward_slot(self.tensor(id)?, t)?;
        self.backend.write_f32(handle, 0, data)
    }

    pub fn read_tensor(&mut self, id: TensorId, t: usize) -> Result<Vec<f32>> {
        self.require_compiled()?;
        let tensor = self.tensor(id)?;
        let n = tensor.shape().elements();
        let handle = Self::forward_slot(tensor, t)?;
        let mut out = vec![0.0; n];
        self.backend.read_f32(handle, 0, &mut out)?;
        Ok(out)
    }

    pub fn write_gradient(&mut self, id: TensorId, t: usize, data: &[f32]) -> Result<()> {
        self.require_compiled()?;
        let handle = self.tensor(id)?.backward_buffer_at(t)?;
        self.backend.write_f32(handle, 0, data)
    }

    pub fn read_gradient(&mut self, id: TensorId, t: usize) -> Result<Vec<f32>> {
        self.require_compiled()?;
        let tensor = self.tensor(id)?;
        let n = tensor.shape().elements();
        let handle = tensor.backward_buffer_at(t)?;
        let mut out = vec![0.0; n];
        self.backend.read_f32(handle, 0, &mut out)?;
        Ok(out)
    }

    /// Optimizer auxiliary buffer `index` of a parameter.
    pub fn read_aux(&mut self, id: TensorId, index: usize) -> Result<Vec<f32>> {
        self.require_compiled()?;
        let tensor = self.tensor(id)?;
        if tensor.kind() != TensorKind::Parameter {
            return Err(NnError::Range(format!("tensor {} has no auxiliary buffers", id.0)));
        }
        let n = tensor.shape().elements();
        let handle = tensor.forward_buffer_at(index)?;
        let mut out = vec![0.0; n];
        self.backend.read_f32(handle, 0, &mut out)?;
        Ok(out)
    }

    /// Writes `steps` timesteps laid out batch-major: row `b`, then step `t`,
    /// then the row's elements.
    pub fn write_sequence(&mut self, id: TensorId, data: &[f32], steps: usize) -> Result<()> {
        self.require_compiled()?;
        let tensor = self.tensor(id)?;
        let shape = tensor.shape();
        let (row, rows) = (shape.row_elements(), shape.w);
        if steps > tensor.seq() || data.len() != rows * steps * row {
            return Err(NnError::Range(format!(
                "sequence of {} values does not fill {steps} steps of {shape} (sequence {})",
                data.len(),
                tensor.seq()
            )));
        }
        let n = shape.elements();
        for t in 0..steps {
            let handle = Self::forward_slot(&self.tensors[id.0], t)?;
            for b in 0..rows {
                let src = (b * steps + t) * row;
                self.staging[b * row..(b + 1) * row].copy_from_slice(&data[src..src + row]);
            }
            self.backend.write_f32(handle, 0, &self.staging[..n])?;
        }
        Ok(())
    }

    /// Writes every named tensor in `ids` as one snapshot record.
    pub fn save_snapshot(&mut self, path: impl AsRef<Path>, ids: &[TensorId]) -> Result<()> {
        self.require_compiled()?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let name = self
                .tensor(*id)?
                .name()
                .ok_or_else(|| NnError::Graph(format!("tensor {} has no snapshot name", id.0)))?
                .to_string();
            records.push((name, self.read_tensor(*id, 0)?));
        }
        let borrowed: Vec<(&str, &[f32])> = records.iter().map(|(n, v)| (n.as_str(), v.as_slice())).collect();
        snapshot::save(path, &borrowed)?;
        info!("saved {} tensors", records.len());
        Ok(())
    }

    /// Loads each named tensor in `ids` from a snapshot made for the same
    /// shapes.
    pub fn load_snapshot(&mut self, path: impl AsRef<Path>, ids: &[TensorId]) -> Result<()> {
        self.require_compiled()?;
        let bytes = snapshot::read_file(path)?;
        for id in ids {
            let tensor = self.tensor(*id)?;
            let name = tensor
                .name()
                .ok_or_else(|| NnError::Graph(format!("tensor {} has no snapshot name", id.0)))?;
            let values = snapshot::find_record(&bytes, name, tensor.shape().elements())?;
            self.write_tensor(*id, 0, &values)?;
        }
        info!("loaded {} tensors", ids.len());
        Ok(())
    }

    /// Every parameter tensor, in creation order.
    pub fn parameters(&self) -> Vec<TensorId> {
        self.tensors
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind() == TensorKind::Parameter)
            .map(|(i, _)| TensorId(i))
            .collect()
    }
}
