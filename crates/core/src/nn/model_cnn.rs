use crate::backend::Device;
use crate::error::Result;
use crate::nn::graph::Network;
use crate::nn::init::WeightInit;
use crate::nn::layers::{conv_block, dense, max_pool};
use crate::nn::ops::{Activation, Operator, Padding};
use crate::shape::Shape;
use crate::tensor::TensorId;
use crate::train::TrainableModel;

/// MNIST convnet: two conv/pool stages, a 1024-unit hidden layer and a
/// 10-way softmax trained with cross-entropy.
pub struct LeNet {
    input: TensorId,
    labels: TensorId,
    probs: TensorId,
    loss: TensorId,
    accuracy: TensorId,
    params: Vec<TensorId>,
}

fn parameter<D: Device>(net: &mut Network<D>, name: &str, shape: Shape, init: WeightInit) -> Result<TensorId> {
    let id = net.create_parameter(shape, 1)?;
    net.name_tensor(id, name)?;
    net.init_weight(id, init)?;
    Ok(id)
}

impl LeNet {
    pub const CLASSES: usize = 10;

    pub fn build<D: Device>(net: &mut Network<D>) -> Result<Self> {
        let conv_init = WeightInit::TruncatedNormal { mean: 0.0, stddev: 0.1 };
        let bias_init = WeightInit::Constant(0.1);

        let input = net.create_input(Shape::d3(28, 28, 1), 1)?;
        let labels = net.create_input(Shape::d1(1), 1)?;

        // 28x28x1 -> 28x28x32 -> 14x14x32
        let k1 = parameter(net, "conv1.k", Shape::new(3, 3, 1, 32), conv_init)?;
        let b1 = parameter(net, "conv1.b", Shape::d1(32), bias_init)?;
        let x = conv_block(net, input, k1, b1, Padding::Same)?;
        let x = max_pool(net, x, 2)?;

        // 14x14x32 -> 14x14x64 -> 7x7x64
        let k2 = parameter(net, "conv2.k", Shape::new(3, 3, 32, 64), conv_init)?;
        let b2 = parameter(net, "conv2.b", Shape::d1(64), bias_init)?;
        let x = conv_block(net, x, k2, b2, Padding::Same)?;
        let x = max_pool(net, x, 2)?;

        let w3 = parameter(net, "fc1.w", Shape::d2(1024, 7 * 7 * 64), WeightInit::TruncatedNormalXavier { mean: 0.0 })?;
        let b3 = parameter(net, "fc1.b", Shape::d1(1024), bias_init)?;
        let x = dense(net, x, w3, b3)?;
        let x = net.add_operator(Operator::Activation(Activation::Relu), &[x], 0)?;

        let w4 = parameter(net, "fc2.w", Shape::d2(Self::CLASSES, 1024), WeightInit::TruncatedNormalXavier { mean: 0.0 })?;
        let b4 = parameter(net, "fc2.b", Shape::d1(Self::CLASSES), bias_init)?;
        let logits = dense(net, x, w4, b4)?;

        let probs = net.add_operator(Operator::Softmax, &[logits], 0)?;
        let loss = net.add_operator(Operator::CrossEntropy, &[probs, labels], 0)?;
        let accuracy = net.add_operator(Operator::Accuracy, &[probs, labels], 0)?;

        Ok(Self {
            input,
            labels,
            probs,
            loss,
            accuracy,
            params: vec![k1, b1, k2, b2, w3, b3, w4, b4],
        })
    }

    pub fn probabilities(&self) -> TensorId {
        self.probs
    }
}

impl TrainableModel for LeNet {
    fn input(&self) -> TensorId {
        self.input
    }

    fn labels(&self) -> TensorId {
        self.labels
    }

    fn loss(&self) -> TensorId {
        self.loss
    }

    fn accuracy(&self) -> TensorId {
        self.accuracy
    }

    fn parameters(&self) -> &[TensorId] {
        &self.params
    }
}
