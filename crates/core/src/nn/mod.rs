pub mod graph;
pub mod init;
pub mod layers;
pub mod model_cnn;
pub mod model_mlp;
pub mod ops;
pub mod optim;

pub use graph::Network;
pub use init::{InitOp, WeightInit};
pub use layers::GruParams;
pub use model_cnn::LeNet;
pub use model_mlp::Mlp;
pub use ops::{Activation, OpId, Operator, Padding};
pub use optim::{Adam, GradientDescent, Optimizer};
