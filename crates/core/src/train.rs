use std::time::Instant;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::backend::Device;
use crate::data::batch_queue::BatchQueue;
use crate::nn::graph::Network;
use crate::tensor::TensorId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
    pub step: usize,
}

pub trait Callbacks {
    fn on_step_end(&mut self, _step: usize, _metrics: &Metrics) {}
    fn on_eval(&mut self, _step: usize, _metrics: &Metrics) {}
}

/// Logs every `every`-th step and every evaluation.
pub struct LogProgress {
    pub every: usize,
}

impl Callbacks for LogProgress {
    fn on_step_end(&mut self, step: usize, metrics: &Metrics) {
        if self.every > 0 && (step + 1) % self.every == 0 {
            info!(
                "step {}: loss={:.4}, accuracy={:.2}%",
                step + 1,
                metrics.loss,
                metrics.accuracy * 100.0
            );
        }
    }

    fn on_eval(&mut self, step: usize, metrics: &Metrics) {
        info!(
            "eval after step {}: loss={:.4}, accuracy={:.2}%",
            step + 1,
            metrics.loss,
            metrics.accuracy * 100.0
        );
    }
}

// Models built into a network expose the tensors the training loop drives.
pub trait TrainableModel {
    fn input(&self) -> TensorId;
    fn labels(&self) -> TensorId;
    fn loss(&self) -> TensorId;
    fn accuracy(&self) -> TensorId;
    fn parameters(&self) -> &[TensorId];
}

pub struct Trainer {
    pub steps: usize,
    /// Evaluate every this many steps; 0 disables evaluation.
    pub eval_every: usize,
    pub eval_batches: usize,
}

impl Trainer {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            eval_every: 0,
            eval_batches: 1,
        }
    }

    pub fn with_eval(mut self, every: usize, batches: usize) -> Self {
        self.eval_every = every;
        self.eval_batches = batches.max(1);
        self
    }

    fn step<D: Device, M: TrainableModel + ?Sized>(
        net: &mut Network<D>,
        model: &M,
        queue: &BatchQueue,
        train: bool,
    ) -> Result<Option<(f32, f32)>> {
        let Some(batch) = queue.take_full() else {
            return Ok(None);
        };
        net.write_tensor(model.input(), 0, &batch.inputs)
            .context("writing batch inputs")?;
        net.write_tensor(model.labels(), 0, &batch.labels)
            .context("writing batch labels")?;
        queue.put_empty(batch);

        net.forward()?;
        let loss = net.read_tensor(model.loss(), 0)?[0];
        let accuracy = net.read_tensor(model.accuracy(), 0)?[0];
        if train {
            net.backward()?;
            net.batch_done()?;
        }
        Ok(Some((loss, accuracy)))
    }

    /// Mean loss and accuracy over up to `batches` forward-only batches.
    pub fn evaluate<D: Device, M: TrainableModel + ?Sized>(
        &self,
        net: &mut Network<D>,
        model: &M,
        queue: &BatchQueue,
        step: usize,
    ) -> Result<Metrics> {
        let (mut loss, mut accuracy, mut seen) = (0.0, 0.0, 0);
        for _ in 0..self.eval_batches {
            let Some((l, a)) = Self::step(net, model, queue, false)? else {
                break;
            };
            loss += l;
            accuracy += a;
            seen += 1;
        }
        let n = seen.max(1) as f32;
        Ok(Metrics { loss: loss / n, accuracy: accuracy / n, step })
    }

    pub fn train<D, M, C>(
        &self,
        net: &mut Network<D>,
        model: &M,
        train: &BatchQueue,
        test: Option<&BatchQueue>,
        callbacks: &mut C,
    ) -> Result<Vec<Metrics>>
    where
        D: Device,
        M: TrainableModel + ?Sized,
        C: Callbacks,
    {
        let start = Instant::now();
        let mut history = Vec::with_capacity(self.steps);
        for step in 0..self.steps {
            let Some((loss, accuracy)) = Self::step(net, model, train, true)
                .with_context(|| format!("training step {}", step + 1))?
            else {
                warn!("training data ran out after {step} steps");
                break;
            };
            let metrics = Metrics { loss, accuracy, step };
            callbacks.on_step_end(step, &metrics);
            history.push(metrics);

            if let Some(test) = test {
                if self.eval_every > 0 && (step + 1) % self.eval_every == 0 {
                    let eval = self.evaluate(net, model, test, step)?;
                    callbacks.on_eval(step, &eval);
                }
            }
        }
        info!(
            "trained {} steps in {:.2}s",
            history.len(),
            start.elapsed().as_secs_f32()
        );
        if let Some(profiler) = net.profiler() {
            profiler.log_summary();
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::data::batch_queue::{Batch, BatchSource};
    use crate::nn::model_mlp::Mlp;
    use crate::nn::optim::Adam;
    use crate::shape::Shape;
    use crate::test_support::cpu_network;
    use std::sync::Arc;

    /// Two separable classes: the first half of the features lit, or the second.
    struct Halves {
        flip: bool,
    }

    impl BatchSource for Halves {
        fn fill(&mut self, batch: &mut Batch) -> Result<bool> {
            batch.inputs.clear();
            batch.labels.clear();
            for _ in 0..4 {
                self.flip = !self.flip;
                let class = usize::from(self.flip);
                batch.inputs.extend((0..4).map(|i| if i / 2 == class { 1.0 } else { 0.0 }));
                batch.labels.push(class as f32);
            }
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Recorder {
        steps: usize,
        evals: usize,
    }

    impl Callbacks for Recorder {
        fn on_step_end(&mut self, _step: usize, _metrics: &Metrics) {
            self.steps += 1;
        }

        fn on_eval(&mut self, _step: usize, _metrics: &Metrics) {
            self.evals += 1;
        }
    }

    #[test]
    fn trainer_reports_every_step_and_eval() {
        let mut net = cpu_network(NetworkConfig::default().with_profile(true));
        let model = Mlp::build(&mut net, Shape::d1(4), &[4, 6, 2]).unwrap();
        net.set_optimizer(Box::new(Adam::new(0.05))).unwrap();
        net.compile(4).unwrap();

        let train = Arc::new(BatchQueue::new(2, 16, 4));
        let test = Arc::new(BatchQueue::new(2, 16, 4));
        let _train_producer = train.spawn_producer(Halves { flip: false });
        let _test_producer = test.spawn_producer(Halves { flip: true });

        let mut recorder = Recorder::default();
        let history = Trainer::new(40)
            .with_eval(10, 2)
            .train(&mut net, &model, &train, Some(&test), &mut recorder)
            .unwrap();
        train.close();
        test.close();

        assert_eq!(history.len(), 40);
        assert_eq!(recorder.steps, 40);
        assert_eq!(recorder.evals, 4);
        assert!(history[39].loss < history[0].loss);
        assert!(net.profiler().unwrap().stats(crate::backend::Pass::Forward).is_some());
    }
}
