use crate::backend::{DispatchRequest, KernelArg};
use crate::error::Result;
use crate::launch::LaunchConfig;
use crate::tensor::Tensor;

/// Parameter update rule. One instance governs every parameter of a network;
/// it is asked once per parameter for its update-pass dispatches.
pub trait Optimizer {
    fn name(&self) -> &str;

    /// Auxiliary buffers every parameter must own for this rule.
    fn aux_buffer_count(&self) -> usize {
        0
    }

    fn update_dispatches(&self, param: &Tensor) -> Result<Vec<DispatchRequest>>;
}

pub struct GradientDescent {
    pub alpha: f32,
}

impl GradientDescent {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl Optimizer for GradientDescent {
    fn name(&self) -> &str {
        "sgd"
    }

    fn update_dispatches(&self, param: &Tensor) -> Result<Vec<DispatchRequest>> {
        let n = param.shape().elements();
        Ok(vec![DispatchRequest::new(
            "GradientDescent",
            vec![
                param.backward_buffer()?.into(),
                param.forward_buffer()?.into(),
                KernelArg::float(self.alpha),
                KernelArg::int(n),
            ],
            LaunchConfig::elementwise(n),
        )])
    }
}

pub struct Adam {
    pub alpha: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Adam {
    /// Index of the step counter among the kernel arguments.
    const STEP_ARG: usize = 9;

    pub fn new(alpha: f32) -> Self {
        Self { alpha, beta1: 0.9, beta2: 0.999, epsilon: 1e-8 }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001)
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    /// First and second moment.
    fn aux_buffer_count(&self) -> usize {
        2
    }

    fn update_dispatches(&self, param: &Tensor) -> Result<Vec<DispatchRequest>> {
        let n = param.shape().elements();
        let request = DispatchRequest::new(
            "Adam",
            vec![
                param.backward_buffer()?.into(),
                param.forward_buffer_at(0)?.into(),
                param.forward_buffer_at(1)?.into(),
                param.forward_buffer()?.into(),
                KernelArg::float(self.alpha),
                KernelArg::float(self.beta1),
                KernelArg::float(self.beta2),
                KernelArg::float(self.epsilon),
                KernelArg::int(n),
                KernelArg::int(1),
            ],
            LaunchConfig::elementwise(n),
        )
        .incrementing(Self::STEP_ARG);
        Ok(vec![request])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::error::NnError;
    use crate::ops_cpu::CpuDevice;
    use crate::shape::Shape;
    use crate::tensor::TensorKind;
    use crate::test_support::kernel_registry;

    #[test]
    fn adam_binds_moments_through_auxiliary_buffers() {
        let mut backend = Backend::new(CpuDevice::new(), kernel_registry());
        let mut w = Tensor::new(TensorKind::Parameter, Shape::d2(3, 2), 1);
        let adam = Adam::default();
        w.instantiate(&mut backend, adam.aux_buffer_count()).unwrap();

        let requests = adam.update_dispatches(&w).unwrap();
        assert_eq!(requests.len(), 1);
        let adam_step = &requests[0];
        assert_eq!(adam_step.increment, Some(9));
        assert_eq!(adam_step.args[1], KernelArg::Buffer(w.forward_buffer_at(0).unwrap()));
        assert_eq!(adam_step.args[3], KernelArg::Buffer(w.forward_buffer().unwrap()));
    }

    #[test]
    fn adam_without_auxiliary_buffers_is_a_range_error() {
        let mut backend = Backend::new(CpuDevice::new(), kernel_registry());
        let mut w = Tensor::new(TensorKind::Parameter, Shape::d1(3), 1);
        w.instantiate(&mut backend, 0).unwrap();
        assert!(matches!(Adam::default().update_dispatches(&w), Err(NnError::Range(_))));
        assert_eq!(GradientDescent::new(0.1).update_dispatches(&w).unwrap().len(), 1);
    }
}
