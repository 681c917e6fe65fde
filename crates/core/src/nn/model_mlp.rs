use crate::backend::Device;
use crate::error::{NnError, Result};
use crate::nn::graph::Network;
use crate::nn::init::WeightInit;
use crate::nn::layers::dense;
use crate::nn::ops::{Activation, Operator};
use crate::shape::Shape;
use crate::tensor::TensorId;
use crate::train::TrainableModel;

/// Fully connected classifier: ReLU between hidden layers, softmax on top.
pub struct Mlp {
    input: TensorId,
    labels: TensorId,
    probs: TensorId,
    loss: TensorId,
    accuracy: TensorId,
    params: Vec<TensorId>,
}

impl Mlp {
    /// `layer_sizes` runs from the flattened input width to the class count.
    pub fn build<D: Device>(net: &mut Network<D>, input_shape: Shape, layer_sizes: &[usize]) -> Result<Self> {
        if layer_sizes.len() < 2 || layer_sizes[0] != input_shape.row_elements() {
            return Err(NnError::Graph(format!(
                "layer sizes {layer_sizes:?} must start at the {} input elements and name an output layer",
                input_shape.row_elements()
            )));
        }
        let input = net.create_input(input_shape, 1)?;
        let labels = net.create_input(Shape::d1(1), 1)?;

        let mut params = Vec::new();
        let mut x = input;
        let last = layer_sizes.len() - 2;
        for (i, pair) in layer_sizes.windows(2).enumerate() {
            let w = net.create_parameter(Shape::d2(pair[1], pair[0]), 1)?;
            let b = net.create_parameter(Shape::d1(pair[1]), 1)?;
            net.name_tensor(w, &format!("fc{}.w", i + 1))?;
            net.name_tensor(b, &format!("fc{}.b", i + 1))?;
            net.init_weight(w, WeightInit::TruncatedNormalXavier { mean: 0.0 })?;
            net.init_weight(b, WeightInit::Constant(0.0))?;
            params.extend([w, b]);

            x = dense(net, x, w, b)?;
            if i < last {
                x = net.add_operator(Operator::Activation(Activation::Relu), &[x], 0)?;
            }
        }

        let probs = net.add_operator(Operator::Softmax, &[x], 0)?;
        let loss = net.add_operator(Operator::CrossEntropy, &[probs, labels], 0)?;
        let accuracy = net.add_operator(Operator::Accuracy, &[probs, labels], 0)?;
        Ok(Self { input, labels, probs, loss, accuracy, params })
    }

    pub fn probabilities(&self) -> TensorId {
        self.probs
    }
}

impl TrainableModel for Mlp {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::nn::optim::GradientDescent;
    use crate::test_support::cpu_network;

    #[test]
    fn layer_sizes_must_match_input() {
        let mut net = cpu_network(NetworkConfig::default());
        assert!(Mlp::build(&mut net, Shape::d1(4), &[5, 2]).is_err());
        assert!(Mlp::build(&mut net, Shape::d1(4), &[4]).is_err());
    }

    #[test]
    fn training_step_lowers_loss_on_a_fixed_batch() {
        let mut net = cpu_network(NetworkConfig::default().with_seed(7));
        let model = Mlp::build(&mut net, Shape::d1(4), &[4, 8, 2]).unwrap();
        net.set_optimizer(Box::new(GradientDescent::new(0.5))).unwrap();
        net.compile(4).unwrap();

        let x = [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        let labels = [0.0, 0.0, 1.0, 1.0];
        let mut losses = Vec::new();
        for _ in 0..30 {
            net.write_tensor(model.input(), 0, &x).unwrap();
            net.write_tensor(model.labels(), 0, &labels).unwrap();
            net.forward().unwrap();
            losses.push(net.read_tensor(model.loss(), 0).unwrap()[0]);
            net.backward().unwrap();
            net.batch_done().unwrap();
        }
        assert!(losses[29] < losses[0] * 0.8, "losses: {losses:?}");
    }
}
