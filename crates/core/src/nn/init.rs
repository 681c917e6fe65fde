use rand::rngs::StdRng;
use rand::Rng;

use crate::shape::Shape;
use crate::tensor::TensorId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeightInit {
    Constant(f32),
    Uniform { min: f32, max: f32 },
    Normal { mean: f32, stddev: f32 },
    /// Normal samples further than two standard deviations out are redrawn.
    TruncatedNormal { mean: f32, stddev: f32 },
    /// Truncated normal with `stddev = sqrt(2 / fan_in)`, fan-in being `shape.y`.
    TruncatedNormalXavier { mean: f32 },
}

/// One-shot initializer bound to a parameter, consumed during compilation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InitOp {
    pub target: TensorId,
    pub init: WeightInit,
}

fn standard_normal(rng: &mut StdRng) -> f32 {
    // Box-Muller; `1 - u` keeps the log argument in (0, 1].
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

fn truncated(rng: &mut StdRng, mean: f32, stddev: f32) -> f32 {
    loop {
        let v = mean + stddev * standard_normal(rng);
        if (v - mean).abs() <= 2.0 * stddev {
            return v;
        }
    }
}

impl WeightInit {
    /// Values for a whole parameter of `shape`.
    pub fn sample(&self, shape: Shape, rng: &mut StdRng) -> Vec<f32> {
        let n = shape.elements();
        match *self {
            WeightInit::Constant(value) => vec![value; n],
            WeightInit::Uniform { min, max } if min < max => (0..n).map(|_| rng.gen_range(min..max)).collect(),
            WeightInit::Uniform { min, .. } => vec![min; n],
            WeightInit::Normal { mean, stddev } => (0..n).map(|_| mean + stddev * standard_normal(rng)).collect(),
            WeightInit::TruncatedNormal { mean, stddev } => (0..n).map(|_| truncated(rng, mean, stddev)).collect(),
            WeightInit::TruncatedNormalXavier { mean } => {
                let stddev = (2.0 / shape.y.max(1) as f32).sqrt();
                (0..n).map(|_| truncated(rng, mean, stddev)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn constant_fills_every_element() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(WeightInit::Constant(0.5).sample(Shape::d2(3, 2), &mut rng), vec![0.5; 6]);
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(2);
        let values = WeightInit::Uniform { min: -0.1, max: 0.1 }.sample(Shape::d1(1000), &mut rng);
        assert!(values.iter().all(|v| (-0.1..0.1).contains(v)));
    }

    #[test]
    fn truncated_normal_is_clipped_at_two_sigma() {
        let mut rng = StdRng::seed_from_u64(3);
        let values = WeightInit::TruncatedNormal { mean: 1.0, stddev: 0.5 }.sample(Shape::d1(5000), &mut rng);
        assert!(values.iter().all(|v| (v - 1.0).abs() <= 1.0));
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!((mean - 1.0).abs() < 0.05);
    }

    #[test]
    fn xavier_scales_with_fan_in() {
        let mut rng = StdRng::seed_from_u64(4);
        let values = WeightInit::TruncatedNormalXavier { mean: 0.0 }.sample(Shape::d2(10, 200), &mut rng);
        let bound = 2.0 * (2.0f32 / 200.0).sqrt();
        assert!(values.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn sampling_is_deterministic_per_seed() {
        let init = WeightInit::Normal { mean: 0.0, stddev: 1.0 };
        let a = init.sample(Shape::d1(16), &mut StdRng::seed_from_u64(99));
        let b = init.sample(Shape::d1(16), &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }
}
