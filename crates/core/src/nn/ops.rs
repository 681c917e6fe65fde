//! Operator kinds: output shape and time inference, scratch requirements and
//! the dispatches each kind emits per unroll step.

use crate::backend::{DispatchRequest, KernelArg};
use crate::error::{NnError, Result};
use crate::launch::LaunchConfig;
use crate::ops_cpu::conv::conv_output_extent;
use crate::ops_cpu::pool::pool_output_extent;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Index of an operator inside its network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Convolution padding, either symbolic or an explicit pixel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    Valid,
    Same,
    Full,
    Explicit(usize),
}

impl Padding {
    pub fn resolve(&self, kernel_width: usize) -> usize {
        match *self {
            Padding::Valid => 0,
            Padding::Same => kernel_width / 2,
            Padding::Full => kernel_width.saturating_sub(1),
            Padding::Explicit(pad) => pad,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
}

impl Activation {
    fn kernel(&self) -> &'static str {
        match self {
            Activation::Relu => "ReLU",
            Activation::Sigmoid => "Sigmoid",
            Activation::Tanh => "Tanh",
        }
    }

    fn grad_kernel(&self) -> &'static str {
        match self {
            Activation::Relu => "ReLUGrad",
            Activation::Sigmoid => "SigmoidGrad",
            Activation::Tanh => "TanhGrad",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    /// `C = A·B`, `A.x` contracted against `B.y`.
    MatMul,
    /// Matmul with `A`'s x, y and z flattened into the contraction axis.
    MatMulFlat,
    Conv2d { pad: Padding, stride: usize },
    Activation(Activation),
    Softmax,
    ElemWiseProduct,
    /// `C = A + B`, written `time_result` timesteps away from the cursor.
    Add { time_result: i64 },
    Copy { time_result: i64 },
    SubtractFromConst(f32),
    AddBias,
    AddBiasConv,
    MaxPool { pad: usize, stride: usize, size: usize },
    Transpose,
    CrossEntropy,
    LeastSquares,
    Accuracy,
    /// Cuts each x/y plane into `tile_x × tile_y` tiles, one per timestep.
    Split { tile_x: usize, tile_y: usize },
    /// Seeds slot 0 of the output once, at the first unroll step.
    CopyInit,
}

/// Dispatches one operator contributes to a single unroll step. Backward
/// entries are in append order; the backend replays them reversed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Emission {
    pub forward: Vec<DispatchRequest>,
    pub backward: Vec<DispatchRequest>,
}

fn fwd(t: &Tensor) -> Result<KernelArg> {
    t.forward_buffer().map(KernelArg::Buffer)
}

fn bwd(t: &Tensor) -> Result<KernelArg> {
    t.backward_buffer().map(KernelArg::Buffer)
}

fn int(v: usize) -> KernelArg {
    KernelArg::int(v)
}

fn request(kernel: &str, args: Vec<KernelArg>, launch: LaunchConfig) -> DispatchRequest {
    DispatchRequest::new(kernel, args, launch)
}

fn same_elements(op: &Operator, a: &Shape, b: &Shape) -> Result<()> {
    if a.elements() != b.elements() {
        return Err(NnError::Graph(format!(
            "{} needs equal element counts, got {a} and {b}",
            op.name()
        )));
    }
    Ok(())
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::MatMul => "MatMul",
            Operator::MatMulFlat => "MatMulFlat",
            Operator::Conv2d { .. } => "Conv2D",
            Operator::Activation(a) => a.kernel(),
            Operator::Softmax => "Softmax",
            Operator::ElemWiseProduct => "ElemWiseProduct",
            Operator::Add { .. } => "Add",
            Operator::Copy { .. } => "Copy",
            Operator::SubtractFromConst(_) => "SubtractFromConst",
            Operator::AddBias => "AddBias",
            Operator::AddBiasConv => "AddBiasConv",
            Operator::MaxPool { .. } => "MaxPool",
            Operator::Transpose => "Transpose",
            Operator::CrossEntropy => "CrossEntropy",
            Operator::LeastSquares => "LeastSquares",
            Operator::Accuracy => "Accuracy",
            Operator::Split { .. } => "Split",
            Operator::CopyInit => "CopyInit",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Operator::MatMul
            | Operator::MatMulFlat
            | Operator::Conv2d { .. }
            | Operator::ElemWiseProduct
            | Operator::Add { .. }
            | Operator::AddBias
            | Operator::AddBiasConv
            | Operator::CrossEntropy
            | Operator::LeastSquares
            | Operator::Accuracy => 2,
            _ => 1,
        }
    }

    /// Losses and metrics fold every batch row into one value.
    pub fn reduces_batch(&self) -> bool {
        matches!(self, Operator::CrossEntropy | Operator::LeastSquares | Operator::Accuracy)
    }

    /// `(rows, contraction)` of the left matmul operand.
    fn matmul_dims(&self, a: &Shape) -> (usize, usize) {
        let k = match self {
            Operator::MatMulFlat => a.row_elements(),
            _ => a.x,
        };
        (a.elements() / k.max(1), k)
    }

    fn conv_dims(&self, a: &Shape, k: &Shape) -> Result<(usize, usize, usize)> {
        let Operator::Conv2d { pad, stride } = self else {
            return Err(NnError::Graph(format!("{} is not a convolution", self.name())));
        };
        let pad = pad.resolve(k.x);
        match (
            conv_output_extent(a.x, k.x, pad, *stride),
            conv_output_extent(a.y, k.y, pad, *stride),
        ) {
            (Some(ox), Some(oy)) => Ok((ox, oy, pad)),
            _ => Err(NnError::Graph(format!(
                "convolution of {a} by {k} (pad {pad}, stride {stride}) has no output"
            ))),
        }
    }

    /// Output shape from the bound input shapes; rejects inconsistent wiring.
    pub fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        if inputs.len() != self.arity() {
            return Err(NnError::Graph(format!(
                "{} takes {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }
        let a = inputs[0];
        match self {
            Operator::MatMul | Operator::MatMulFlat => {
                let b = inputs[1];
                let (_, k) = self.matmul_dims(&a);
                if b.y != k || b.z * b.w != 1 {
                    return Err(NnError::Graph(format!(
                        "{} cannot contract {a} with {b}",
                        self.name()
                    )));
                }
                Ok(match self {
                    Operator::MatMulFlat => Shape::new(b.x, 1, 1, a.w),
                    _ => Shape::new(b.x, a.y, a.z, a.w),
                })
            }
            Operator::Conv2d { .. } => {
                let k = inputs[1];
                if k.z != a.z {
                    return Err(NnError::Graph(format!(
                        "kernel {k} does not match {} input channels",
                        a.z
                    )));
                }
                let (ox, oy, _) = self.conv_dims(&a, &k)?;
                Ok(Shape::new(ox, oy, k.w, a.w))
            }
            Operator::ElemWiseProduct | Operator::Add { .. } => {
                same_elements(self, &a, &inputs[1])?;
                Ok(a)
            }
            Operator::AddBias => {
                if inputs[1].elements() != a.row_elements() {
                    return Err(NnError::Graph(format!("bias {} does not match rows of {a}", inputs[1])));
                }
                Ok(a)
            }
            Operator::AddBiasConv => {
                if inputs[1].elements() != a.z {
                    return Err(NnError::Graph(format!("bias {} does not match {} channels", inputs[1], a.z)));
                }
                Ok(a)
            }
            Operator::MaxPool { pad, stride, size } => match (
                pool_output_extent(a.x, *size, *pad, *stride),
                pool_output_extent(a.y, *size, *pad, *stride),
            ) {
                (Some(ox), Some(oy)) => Ok(Shape::new(ox, oy, a.z, a.w)),
                _ => Err(NnError::Graph(format!(
                    "pooling {a} with window {size} stride {stride} has no output"
                ))),
            },
            Operator::Transpose => Ok(Shape::new(a.y, a.x, a.z, a.w)),
            Operator::CrossEntropy | Operator::Accuracy => {
                if inputs[1].elements() != a.w {
                    return Err(NnError::Graph(format!(
                        "{} needs one label per row of {a}, got {}",
                        self.name(),
                        inputs[1]
                    )));
                }
                Ok(Shape::d1(1))
            }
            Operator::LeastSquares => {
                same_elements(self, &a, &inputs[1])?;
                Ok(Shape::d1(1))
            }
            Operator::Split { tile_x, tile_y } => {
                if *tile_x == 0 || *tile_y == 0 {
                    return Err(NnError::Graph("split tiles must be non-empty".to_string()));
                }
                Ok(Shape::new(*tile_x, *tile_y, a.z, a.w))
            }
            Operator::Activation(_)
            | Operator::Softmax
            | Operator::Copy { .. }
            | Operator::SubtractFromConst(_)
            | Operator::CopyInit => Ok(a),
        }
    }

    /// Sequence length of the output. Split counts its tiles; everything
    /// else spans the latest-ending input. An operator's own time offset
    /// only delays its first step and does not shorten the output.
    pub fn sequence_length(&self, inputs: &[&Tensor]) -> usize {
        if let (Operator::Split { tile_x, tile_y }, Some(a)) = (self, inputs.first()) {
            let shape = a.shape();
            return shape.x.div_ceil((*tile_x).max(1)) * shape.y.div_ceil((*tile_y).max(1));
        }
        inputs
            .iter()
            .map(|t| t.seq() + t.time_offset())
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Element counts of the scratch buffers this operator needs, in slot
    /// order, from finalized input shapes.
    pub fn scratch_elements(&self, inputs: &[Shape]) -> Vec<usize> {
        match self {
            Operator::MatMul | Operator::MatMulFlat => {
                vec![inputs[0].elements().max(inputs[1].elements())]
            }
            Operator::Conv2d { .. } => vec![inputs[1].elements()],
            _ => Vec::new(),
        }
    }

    /// Dispatches for the current unroll step, reading every tensor at its
    /// cursor.
    pub fn emit(&self, inputs: &[&Tensor], output: &Tensor, scratch: &[&Tensor]) -> Result<Emission> {
        let mut e = Emission::default();
        let a = inputs.first().copied().ok_or_else(|| {
            NnError::Graph(format!("{} has no bound inputs", self.name()))
        })?;
        let b = inputs.get(1).copied();
        let second = || {
            b.ok_or_else(|| NnError::Graph(format!("{} is missing its second input", self.name())))
        };
        let tmp = || {
            scratch.first().copied().ok_or_else(|| {
                NnError::Graph(format!("{} was not given a scratch buffer", self.name()))
            })
        };
        let sa = a.shape();
        let n = sa.elements();

        match self {
            Operator::MatMul | Operator::MatMulFlat => {
                let b = second()?;
                let tmp = tmp()?;
                let sb = b.shape();
                let (rows, k) = self.matmul_dims(&sa);
                let cols = sb.x;
                e.forward.push(request(
                    "MatrixMul",
                    vec![fwd(a)?, fwd(b)?, fwd(output)?, int(rows), int(cols), int(k)],
                    LaunchConfig::tiled(cols, rows),
                ));
                e.backward.push(request(
                    "MatrixMulAdd",
                    vec![fwd(tmp)?, bwd(output)?, bwd(b)?, int(k), int(cols), int(rows)],
                    LaunchConfig::tiled(cols, k),
                ));
                e.backward.push(request(
                    "Transpose",
                    vec![fwd(a)?, fwd(tmp)?, int(k), int(rows)],
                    LaunchConfig::planes(k, rows, 1),
                ));
                e.backward.push(request(
                    "MatrixMulAdd",
                    vec![bwd(output)?, fwd(tmp)?, bwd(a)?, int(rows), int(k), int(cols)],
                    LaunchConfig::tiled(k, rows),
                ));
                e.backward.push(request(
                    "Transpose",
                    vec![fwd(b)?, fwd(tmp)?, int(cols), int(k)],
                    LaunchConfig::planes(cols, k, 1),
                ));
            }
            Operator::Conv2d { stride, .. } => {
                let kernel = second()?;
                let tmp = tmp()?;
                let sk = kernel.shape();
                let (out_x, out_y, pad) = self.conv_dims(&sa, &sk)?;
                let batch = sa.w;
                e.forward.push(request(
                    "Convolution",
                    vec![
                        fwd(a)?, fwd(kernel)?, fwd(output)?,
                        int(sa.x), int(sa.y), int(sk.x), int(sk.y), int(sk.z), int(sk.w),
                        int(pad), int(*stride), int(batch),
                    ],
                    LaunchConfig::planes(out_x, out_y, sk.w * batch),
                ));
                e.backward.push(request(
                    "ConvolutionWeightGrad",
                    vec![
                        fwd(a)?, bwd(output)?, bwd(kernel)?,
                        int(sa.x), int(sa.y), int(out_x), int(out_y),
                        int(sk.x), int(sk.y), int(sk.z), int(sk.w),
                        int(pad), int(*stride), int(batch),
                    ],
                    LaunchConfig::planes(sk.x, sk.y, sk.z * sk.w),
                ));
                e.backward.push(request(
                    "ConvolutionAdd",
                    vec![
                        bwd(output)?, fwd(tmp)?, bwd(a)?,
                        int(out_x), int(out_y), int(sk.x), int(sk.y), int(sk.w), int(sk.z),
                        KernelArg::signed(sk.x as i64 - 1 - pad as i64),
                        KernelArg::signed(sk.y as i64 - 1 - pad as i64),
                        int(*stride), int(sa.x), int(sa.y), int(batch),
                    ],
                    LaunchConfig::planes(sa.x, sa.y, sk.z * batch),
                ));
                e.backward.push(request(
                    "RotateAndReorder",
                    vec![fwd(kernel)?, fwd(tmp)?, int(sk.x), int(sk.y), int(sk.z), int(sk.w)],
                    LaunchConfig::planes(sk.x, sk.y, sk.z * sk.w),
                ));
            }
            Operator::Activation(kind) => {
                e.forward.push(request(kind.kernel(), vec![fwd(a)?, fwd(output)?, int(n)], LaunchConfig::elementwise(n)));
                let saved = match kind {
                    Activation::Relu => fwd(a)?,
                    Activation::Sigmoid | Activation::Tanh => fwd(output)?,
                };
                e.backward.push(request(
                    kind.grad_kernel(),
                    vec![saved, bwd(output)?, bwd(a)?, int(n)],
                    LaunchConfig::elementwise(n),
                ));
            }
            Operator::Softmax => {
                let (cols, rows) = (sa.row_elements(), sa.w);
                e.forward.push(request(
                    "Softmax",
                    vec![fwd(a)?, fwd(output)?, int(cols), int(rows)],
                    LaunchConfig::elementwise(rows),
                ));
                e.backward.push(request(
                    "SoftmaxGrad",
                    vec![bwd(output)?, fwd(output)?, bwd(a)?, int(cols), int(rows)],
                    LaunchConfig::elementwise(rows),
                ));
            }
            Operator::ElemWiseProduct => {
                let b = second()?;
                same_elements(self, &sa, &b.shape())?;
                e.forward.push(request(
                    "ElemWiseProduct",
                    vec![fwd(a)?, fwd(b)?, fwd(output)?, int(n)],
                    LaunchConfig::elementwise(n),
                ));
                e.backward.push(request(
                    "ElemWiseProductAdd",
                    vec![fwd(a)?, bwd(output)?, bwd(b)?, int(n)],
                    LaunchConfig::elementwise(n),
                ));
                e.backward.push(request(
                    "ElemWiseProductAdd",
                    vec![fwd(b)?, bwd(output)?, bwd(a)?, int(n)],
                    LaunchConfig::elementwise(n),
                ));
            }
            Operator::Add { time_result } => {
                let b = second()?;
                same_elements(self, &sa, &b.shape())?;
                let out_f = KernelArg::Buffer(output.forward_buffer_shifted(*time_result)?);
                let out_b = KernelArg::Buffer(output.backward_buffer_shifted(*time_result)?);
                e.forward.push(request("Add", vec![fwd(a)?, fwd(b)?, out_f, int(n)], LaunchConfig::elementwise(n)));
                e.backward.push(request("CopyAdd", vec![out_b.clone(), bwd(a)?, int(n)], LaunchConfig::elementwise(n)));
                e.backward.push(request("CopyAdd", vec![out_b, bwd(b)?, int(n)], LaunchConfig::elementwise(n)));
            }
            Operator::Copy { time_result } => {
                let out_f = KernelArg::Buffer(output.forward_buffer_shifted(*time_result)?);
                let out_b = KernelArg::Buffer(output.backward_buffer_shifted(*time_result)?);
                e.forward.push(request("Copy", vec![fwd(a)?, out_f, int(n)], LaunchConfig::elementwise(n)));
                e.backward.push(request("CopyAdd", vec![out_b, bwd(a)?, int(n)], LaunchConfig::elementwise(n)));
            }
            Operator::SubtractFromConst(constant) => {
                e.forward.push(request(
                    "SubtractFromConst",
                    vec![fwd(a)?, fwd(output)?, KernelArg::float(*constant), int(n)],
                    LaunchConfig::elementwise(n),
                ));
                e.backward.push(request(
                    "SubtractFromConstGrad",
                    vec![bwd(output)?, bwd(a)?, int(n)],
                    LaunchConfig::elementwise(n),
                ));
            }
            Operator::AddBias => {
                let bias = second()?;
                let (cols, rows) = (sa.row_elements(), sa.w);
                e.forward.push(request(
                    "AddToMatrix",
                    vec![fwd(a)?, fwd(bias)?, fwd(output)?, int(cols), int(rows)],
                    LaunchConfig::elementwise(n),
                ));
                e.backward.push(request("CopyAdd", vec![bwd(output)?, bwd(a)?, int(n)], LaunchConfig::elementwise(n)));
                e.backward.push(request(
                    "AddToMatrixGrad",
                    vec![bwd(output)?, bwd(bias)?, int(cols), int(rows)],
                    LaunchConfig::elementwise(cols),
                ));
            }
            Operator::AddBiasConv => {
                let bias = second()?;
                let (plane, channels, batch) = (sa.x * sa.y, sa.z, sa.w);
                e.forward.push(request(
                    "AddToImageTensor",
                    vec![fwd(a)?, fwd(bias)?, fwd(output)?, int(plane), int(channels), int(batch)],
                    LaunchConfig::elementwise(n),
                ));
                e.backward.push(request("CopyAdd", vec![bwd(output)?, bwd(a)?, int(n)], LaunchConfig::elementwise(n)));
                e.backward.push(request(
                    "AddToImageTensorGrad",
                    vec![bwd(output)?, bwd(bias)?, int(plane), int(channels), int(batch)],
                    LaunchConfig::elementwise(channels),
                ));
            }
            Operator::MaxPool { pad, stride, size } => {
                let so = output.shape();
                let planes = sa.z * sa.w;
                let scalars = [sa.x, sa.y, planes, *stride, *pad, *pad, *size].map(int);
                let mut forward_args = vec![fwd(a)?, fwd(output)?];
                forward_args.extend(scalars.iter().cloned());
                e.forward.push(request("MaxPooling", forward_args, LaunchConfig::planes(so.x, so.y, planes)));
                let mut backward_args = vec![fwd(a)?, bwd(output)?, bwd(a)?];
                backward_args.extend(scalars);
                e.backward.push(request("MaxPoolingGrad", backward_args, LaunchConfig::planes(sa.x, sa.y, planes)));
            }
            Operator::Transpose => {
                e.forward.push(request(
                    "Transpose",
                    vec![fwd(a)?, fwd(output)?, int(sa.x), int(sa.y)],
                    LaunchConfig::planes(sa.x, sa.y, sa.z * sa.w),
                ));
            }
            Operator::CrossEntropy | Operator::Accuracy | Operator::LeastSquares => {
                let label = second()?;
                let (cols, rows) = (sa.row_elements(), sa.w);
                let kernel = match self {
                    Operator::CrossEntropy => "CrossEntropy",
                    Operator::Accuracy => "ClassificationAccuracy",
                    _ => "MeanSquaredError",
                };
                e.forward.push(request(
                    kernel,
                    vec![fwd(a)?, fwd(label)?, fwd(output)?, int(cols), int(rows)],
                    LaunchConfig::single(),
                ));
                match self {
                    Operator::CrossEntropy => e.backward.push(request(
                        "CrossEntropyGrad",
                        vec![fwd(a)?, fwd(label)?, bwd(a)?, int(cols), int(rows)],
                        LaunchConfig::elementwise(rows),
                    )),
                    Operator::LeastSquares => e.backward.push(request(
                        "MeanSquaredErrorGrad",
                        vec![fwd(a)?, fwd(label)?, bwd(a)?, int(n), int(rows)],
                        LaunchConfig::elementwise(n),
                    )),
                    _ => {}
                }
            }
            Operator::Split { tile_x, tile_y } => {
                let planes = sa.z * sa.w;
                let scalars = [output.cursor(), *tile_x, *tile_y, sa.x, sa.y, sa.z, sa.w].map(int);
                let launch = LaunchConfig::planes(*tile_x, *tile_y, planes);
                let mut forward_args = vec![fwd(a)?, fwd(output)?];
                forward_args.extend(scalars.iter().cloned());
                e.forward.push(request("SplitData", forward_args, launch));
                let mut backward_args = vec![bwd(output)?, bwd(a)?];
                backward_args.extend(scalars);
                e.backward.push(request("SplitDataGrad", backward_args, launch));
            }
            Operator::CopyInit => {
                if output.cursor() == 0 {
                    let out_f = KernelArg::Buffer(output.forward_buffer_at(0)?);
                    let out_b = KernelArg::Buffer(output.backward_buffer_at(0)?);
                    e.forward.push(request("Copy", vec![fwd(a)?, out_f, int(n)], LaunchConfig::elementwise(n)));
                    e.backward.push(request("CopyAdd", vec![out_b, bwd(a)?, int(n)], LaunchConfig::elementwise(n)));
                }
            }
        }
        Ok(e)
    }
}
