use super::HostArgs;
use crate::error::Result;

/// Row-major `c = alpha * a·b + beta * c` with `a` m×k and `b` k×n.
pub fn naive_gemm(
    a: &[f32], b: &[f32], c: &mut [f32],
    m: usize, n: usize, k: usize,
    alpha: f32, beta: f32
) {
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = alpha * sum + beta * c[i * n + j];
        }
    }
}

fn gemm_kernel(args: &mut HostArgs, beta: f32) -> Result<()> {
    let m = args.extent(3)?;
    let n = args.extent(4)?;
    let k = args.extent(5)?;
    let mut c = args.take(2, m * n)?;
    naive_gemm(args.buf(0, m * k)?, args.buf(1, k * n)?, &mut c, m, n, k, 1.0, beta);
    args.put(2, c);
    Ok(())
}

pub fn matrix_mul(args: &mut HostArgs) -> Result<()> {
    gemm_kernel(args, 0.0)
}

pub fn matrix_mul_add(args: &mut HostArgs) -> Result<()> {
    gemm_kernel(args, 1.0)
}

/// Per-plane transpose of a `rows × cols` matrix; plane count comes from the
/// launch's third dimension.
pub fn transpose(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(2)?;
    let rows = args.extent(3)?;
    let planes = args.launch().global[2].max(1);
    let plane = rows * cols;
    let mut out = args.take(1, plane * planes)?;
    let input = args.buf(0, plane * planes)?;
    for p in 0..planes {
        let base = p * plane;
        for r in 0..rows {
            for c in 0..cols {
                out[base + c * rows + r] = input[base + r * cols + c];
            }
        }
    }
    args.put(1, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{buf, int, test_args, test_args_with_launch};
    use super::*;
    use crate::launch::LaunchConfig;

    #[test]
    fn multiplies_row_major_matrices() {
        // [1 2 3; 4 5 6] x [1 0; 0 1; 1 1]
        let mut args = test_args(vec![
            buf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            buf(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            buf(&[100.0; 4]),
            int(2),
            int(2),
            int(3),
        ]);
        matrix_mul(&mut args).unwrap();
        assert_eq!(args.buf(2, 4).unwrap(), &[4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn accumulating_variant_adds_to_output() {
        let mut args = test_args(vec![
            buf(&[2.0]),
            buf(&[3.0]),
            buf(&[1.0]),
            int(1),
            int(1),
            int(1),
        ]);
        matrix_mul_add(&mut args).unwrap();
        assert_eq!(args.buf(2, 1).unwrap(), &[7.0]);
    }

    #[test]
    fn transposes_each_plane() {
        let launch = LaunchConfig::planes(3, 2, 2);
        let mut args = test_args_with_launch(
            vec![
                buf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]),
                buf(&[0.0; 12]),
                int(3),
                int(2),
            ],
            launch,
        );
        transpose(&mut args).unwrap();
        assert_eq!(
            args.buf(1, 12).unwrap(),
            &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0, 7.0, 10.0, 8.0, 11.0, 9.0, 12.0]
        );
    }
}
