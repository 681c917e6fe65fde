//! Building blocks composed from graph operators.

use crate::backend::Device;
use crate::error::Result;
use crate::nn::graph::Network;
use crate::nn::init::WeightInit;
use crate::nn::ops::{Activation, Operator, Padding};
use crate::shape::Shape;
use crate::tensor::TensorId;

/// `x·W + b`, with every non-batch axis of `x` contracted.
pub fn dense<D: Device>(net: &mut Network<D>, x: TensorId, w: TensorId, b: TensorId) -> Result<TensorId> {
    let y = net.add_operator(Operator::MatMulFlat, &[x, w], 0)?;
    net.add_operator(Operator::AddBias, &[y, b], 0)
}

/// Convolution, per-channel bias, then ReLU.
pub fn conv_block<D: Device>(
    net: &mut Network<D>,
    x: TensorId,
    kernel: TensorId,
    bias: TensorId,
    pad: Padding,
) -> Result<TensorId> {
    let y = net.add_operator(Operator::Conv2d { pad, stride: 1 }, &[x, kernel], 0)?;
    let y = net.add_operator(Operator::AddBiasConv, &[y, bias], 0)?;
    net.add_operator(Operator::Activation(Activation::Relu), &[y], 0)
}

pub fn max_pool<D: Device>(net: &mut Network<D>, x: TensorId, size: usize) -> Result<TensorId> {
    net.add_operator(Operator::MaxPool { pad: 0, stride: size, size }, &[x], 0)
}

/// Seeds slot 0 of the recurrent state `s` from `a` at the first unroll step.
pub fn copy_init<D: Device>(net: &mut Network<D>, a: TensorId, s: TensorId) -> Result<TensorId> {
    net.add_operator_into(Operator::CopyInit, &[a], s, 0)
}

/// Weights of one GRU unit. `u_*` act on the input, `w_*` on the state.
#[derive(Clone, Copy, Debug)]
pub struct GruParams {
    pub u_z: TensorId,
    pub w_z: TensorId,
    pub b_z: TensorId,
    pub u_r: TensorId,
    pub w_r: TensorId,
    pub b_r: TensorId,
    pub u_h: TensorId,
    pub w_h: TensorId,
    pub b_h: TensorId,
}

impl GruParams {
    /// Creates and initializes the parameters for `input` elements per row
    /// and a state of `hidden` units. Names are prefixed with `prefix`.
    pub fn create<D: Device>(net: &mut Network<D>, prefix: &str, input: usize, hidden: usize) -> Result<Self> {
        let make = |net: &mut Network<D>, gate: &str| -> Result<(TensorId, TensorId, TensorId)> {
            let u = net.create_parameter(Shape::d2(hidden, input), 1)?;
            let w = net.create_parameter(Shape::d2(hidden, hidden), 1)?;
            let b = net.create_parameter(Shape::d1(hidden), 1)?;
            net.name_tensor(u, &format!("{prefix}.u_{gate}"))?;
            net.name_tensor(w, &format!("{prefix}.w_{gate}"))?;
            net.name_tensor(b, &format!("{prefix}.b_{gate}"))?;
            net.init_weight(u, WeightInit::TruncatedNormalXavier { mean: 0.0 })?;
            net.init_weight(w, WeightInit::TruncatedNormalXavier { mean: 0.0 })?;
            net.init_weight(b, WeightInit::Constant(0.0))?;
            Ok((u, w, b))
        };
        let (u_z, w_z, b_z) = make(net, "z")?;
        let (u_r, w_r, b_r) = make(net, "r")?;
        let (u_h, w_h, b_h) = make(net, "h")?;
        Ok(Self { u_z, w_z, b_z, u_r, w_r, b_r, u_h, w_h, b_h })
    }

    pub fn all(&self) -> [TensorId; 9] {
        [
            self.u_z, self.w_z, self.b_z, self.u_r, self.w_r, self.b_r, self.u_h, self.w_h, self.b_h,
        ]
    }
}

fn gate<D: Device>(
    net: &mut Network<D>,
    a: TensorId,
    s: TensorId,
    u: TensorId,
    w: TensorId,
    b: TensorId,
    activation: Activation,
) -> Result<TensorId> {
    let from_input = net.add_operator(Operator::MatMulFlat, &[a, u], 0)?;
    let from_state = net.add_operator(Operator::MatMul, &[s, w], 0)?;
    let sum = net.add_operator(Operator::Add { time_result: 0 }, &[from_input, from_state], 0)?;
    let biased = net.add_operator(Operator::AddBias, &[sum, b], 0)?;
    net.add_operator(Operator::Activation(activation), &[biased], 0)
}

/// One GRU step over input `a` and state `s`. The new state is returned and
/// also copied into `s` one timestep ahead, after every read of the current
/// state has been registered.
pub fn gru_unit<D: Device>(net: &mut Network<D>, a: TensorId, s: TensorId, p: &GruParams) -> Result<TensorId> {
    let z = gate(net, a, s, p.u_z, p.w_z, p.b_z, Activation::Sigmoid)?;
    let r = gate(net, a, s, p.u_r, p.w_r, p.b_r, Activation::Sigmoid)?;
    let gated = net.add_operator(Operator::ElemWiseProduct, &[s, r], 0)?;
    let h = gate(net, a, gated, p.u_h, p.w_h, p.b_h, Activation::Tanh)?;

    let keep = net.add_operator(Operator::SubtractFromConst(1.0), &[z], 0)?;
    let fresh = net.add_operator(Operator::ElemWiseProduct, &[keep, h], 0)?;
    let carried = net.add_operator(Operator::ElemWiseProduct, &[z, s], 0)?;
    let next = net.add_operator(Operator::Add { time_result: 0 }, &[fresh, carried], 0)?;
    net.add_operator_into(Operator::Copy { time_result: 1 }, &[next], s, 0)?;
    Ok(next)
}
