use super::HostArgs;
use crate::error::Result;

pub fn gradient_descent(args: &mut HostArgs) -> Result<()> {
    let alpha = args.float(2)?;
    let n = args.extent(3)?;
    let mut weight = args.take(1, n)?;
    for (w, g) in weight.iter_mut().zip(args.buf(0, n)?) {
        *w -= alpha * g;
    }
    args.put(1, weight);
    Ok(())
}

/// Bias-corrected Adam step; `t` is the 1-based step count.
pub fn adam(args: &mut HostArgs) -> Result<()> {
    let alpha = args.float(4)?;
    let beta1 = args.float(5)?;
    let beta2 = args.float(6)?;
    let epsilon = args.float(7)?;
    let n = args.extent(8)?;
    let t = args.int(9)?.max(1);

    let mut m = args.take(1, n)?;
    let mut v = args.take(2, n)?;
    let mut weight = args.take(3, n)?;
    let grad = args.buf(0, n)?;

    let correction1 = 1.0 - beta1.powi(t);
    let correction2 = 1.0 - beta2.powi(t);
    for i in 0..n {
        m[i] = beta1 * m[i] + (1.0 - beta1) * grad[i];
        v[i] = beta2 * v[i] + (1.0 - beta2) * grad[i] * grad[i];
        let m_hat = m[i] / correction1;
        let v_hat = v[i] / correction2;
        weight[i] -= alpha * m_hat / (v_hat.sqrt() + epsilon);
    }

    args.put(1, m);
    args.put(2, v);
    args.put(3, weight);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{buf, float, int, test_args};
    use super::*;

    #[test]
    fn gradient_descent_steps_against_gradient() {
        let mut args = test_args(vec![buf(&[1.0, -2.0]), buf(&[0.5, 0.5]), float(0.1), int(2)]);
        gradient_descent(&mut args).unwrap();
        let w = args.buf(1, 2).unwrap();
        assert!((w[0] - 0.4).abs() < 1e-6);
        assert!((w[1] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn first_adam_step_moves_by_alpha() {
        let mut args = test_args(vec![
            buf(&[0.3, -4.0]),
            buf(&[0.0; 2]),
            buf(&[0.0; 2]),
            buf(&[1.0, 1.0]),
            float(0.01),
            float(0.9),
            float(0.999),
            float(1e-8),
            int(2),
            int(1),
        ]);
        adam(&mut args).unwrap();
        let w = args.buf(3, 2).unwrap();
        assert!((w[0] - 0.99).abs() < 1e-5);
        assert!((w[1] - 1.01).abs() < 1e-5);
        let m = args.buf(1, 2).unwrap();
        assert!((m[1] + 0.4).abs() < 1e-6);
    }
}
