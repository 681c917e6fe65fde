use super::HostArgs;
use crate::error::Result;

fn map(args: &mut HostArgs, f: impl Fn(f32) -> f32) -> Result<()> {
    let n = args.extent(2)?;
    let mut output = args.take(1, n)?;
    for (o, &x) in output.iter_mut().zip(args.buf(0, n)?) {
        *o = f(x);
    }
    args.put(1, output);
    Ok(())
}

/// `grad_input += grad_output * f(saved)` where `saved` is argument 0.
fn accumulate_grad(args: &mut HostArgs, f: impl Fn(f32) -> f32) -> Result<()> {
    let n = args.extent(3)?;
    let mut grad_input = args.take(2, n)?;
    let saved = args.buf(0, n)?;
    let grad_output = args.buf(1, n)?;
    for i in 0..n {
        grad_input[i] += grad_output[i] * f(saved[i]);
    }
    args.put(2, grad_input);
    Ok(())
}

pub fn relu(args: &mut HostArgs) -> Result<()> {
    map(args, |x| x.max(0.0))
}

/// Saved value is the forward input.
pub fn relu_grad(args: &mut HostArgs) -> Result<()> {
    accumulate_grad(args, |x| if x > 0.0 { 1.0 } else { 0.0 })
}

pub fn sigmoid(args: &mut HostArgs) -> Result<()> {
    map(args, |x| 1.0 / (1.0 + (-x).exp()))
}

/// Saved value is the forward output.
pub fn sigmoid_grad(args: &mut HostArgs) -> Result<()> {
    accumulate_grad(args, |y| y * (1.0 - y))
}

pub fn tanh(args: &mut HostArgs) -> Result<()> {
    map(args, f32::tanh)
}

/// Saved value is the forward output.
pub fn tanh_grad(args: &mut HostArgs) -> Result<()> {
    accumulate_grad(args, |y| 1.0 - y * y)
}

#[cfg(test)]
mod tests {
    use super::super::{buf, int, test_args};
    use super::*;

    #[test]
    fn relu_forward_and_backward() {
        let mut args = test_args(vec![buf(&[-1.0, 0.5, 0.0, 2.0]), buf(&[9.0; 4]), int(4)]);
        relu(&mut args).unwrap();
        assert_eq!(args.buf(1, 4).unwrap(), &[0.0, 0.5, 0.0, 2.0]);

        let mut args = test_args(vec![
            buf(&[-1.0, 0.5, 0.0, 2.0]),
            buf(&[1.0, 1.0, 1.0, 3.0]),
            buf(&[0.5; 4]),
            int(4),
        ]);
        relu_grad(&mut args).unwrap();
        assert_eq!(args.buf(2, 4).unwrap(), &[0.5, 1.5, 0.5, 3.5]);
    }

    #[test]
    fn sigmoid_grad_uses_saved_output() {
        let mut args = test_args(vec![buf(&[0.0]), buf(&[0.0]), int(1)]);
        sigmoid(&mut args).unwrap();
        let y = args.buf(1, 1).unwrap()[0];
        assert!((y - 0.5).abs() < 1e-6);

        let mut args = test_args(vec![buf(&[y]), buf(&[2.0]), buf(&[0.0]), int(1)]);
        sigmoid_grad(&mut args).unwrap();
        assert!((args.buf(2, 1).unwrap()[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn tanh_grad_matches_derivative() {
        let y = 0.3f32.tanh();
        let mut args = test_args(vec![buf(&[y]), buf(&[1.0]), buf(&[0.0]), int(1)]);
        tanh_grad(&mut args).unwrap();
        assert!((args.buf(2, 1).unwrap()[0] - (1.0 - y * y)).abs() < 1e-6);
    }
}
