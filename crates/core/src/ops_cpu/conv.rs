use super::HostArgs;
use crate::error::{NnError, Result};

/// Output extent of a strided convolution along one axis.
pub fn conv_output_extent(input: usize, kernel: usize, pad: usize, stride: usize) -> Option<usize> {
    let padded = input + 2 * pad;
    if stride == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

struct Planes<'a> {
    data: &'a [f32],
    x: usize,
    y: usize,
    z: usize,
}

impl Planes<'_> {
    /// Value at signed spatial coordinates, zero outside the plane.
    fn at(&self, w: usize, z: usize, y: isize, x: isize) -> f32 {
        if x < 0 || y < 0 || x as usize >= self.x || y as usize >= self.y {
            return 0.0;
        }
        self.data[((w * self.z + z) * self.y + y as usize) * self.x + x as usize]
    }
}

fn out_extent(in_x: usize, in_y: usize, k_x: usize, k_y: usize, pad: usize, stride: usize) -> Result<(usize, usize)> {
    match (
        conv_output_extent(in_x, k_x, pad, stride),
        conv_output_extent(in_y, k_y, pad, stride),
    ) {
        (Some(ox), Some(oy)) => Ok((ox, oy)),
        _ => Err(NnError::Device(format!(
            "convolution of {in_x}x{in_y} by {k_x}x{k_y} (pad {pad}, stride {stride}) has no output"
        ))),
    }
}

pub fn convolution(args: &mut HostArgs) -> Result<()> {
    let in_x = args.extent(3)?;
    let in_y = args.extent(4)?;
    let k_x = args.extent(5)?;
    let k_y = args.extent(6)?;
    let k_z = args.extent(7)?;
    let k_w = args.extent(8)?;
    let pad = args.extent(9)?;
    let stride = args.extent(10)?;
    let batch = args.extent(11)?;
    let (out_x, out_y) = out_extent(in_x, in_y, k_x, k_y, pad, stride)?;

    let mut out = args.take(2, out_x * out_y * k_w * batch)?;
    let input = Planes { data: args.buf(0, in_x * in_y * k_z * batch)?, x: in_x, y: in_y, z: k_z };
    let kernel = args.buf(1, k_x * k_y * k_z * k_w)?;

    for b in 0..batch {
        for oc in 0..k_w {
            for oy in 0..out_y {
                for ox in 0..out_x {
                    let mut sum = 0.0;
                    for c in 0..k_z {
                        for j in 0..k_y {
                            let iy = (oy * stride + j) as isize - pad as isize;
                            for i in 0..k_x {
                                let ix = (ox * stride + i) as isize - pad as isize;
                                sum += input.at(b, c, iy, ix) * kernel[((oc * k_z + c) * k_y + j) * k_x + i];
                            }
                        }
                    }
                    out[((b * k_w + oc) * out_y + oy) * out_x + ox] = sum;
                }
            }
        }
    }
    args.put(2, out);
    Ok(())
}

/// Accumulating convolution over an input dilated by `dilation`, with signed
/// per-axis padding. Used with a rotated kernel to propagate gradients.
pub fn convolution_add(args: &mut HostArgs) -> Result<()> {
    let in_x = args.extent(3)?;
    let in_y = args.extent(4)?;
    let k_x = args.extent(5)?;
    let k_y = args.extent(6)?;
    let k_z = args.extent(7)?;
    let k_w = args.extent(8)?;
    let pad_x = args.int(9)? as isize;
    let pad_y = args.int(10)? as isize;
    let dilation = args.extent(11)?.max(1) as isize;
    let out_x = args.extent(12)?;
    let out_y = args.extent(13)?;
    let batch = args.extent(14)?;

    let mut out = args.take(2, out_x * out_y * k_w * batch)?;
    let input = Planes { data: args.buf(0, in_x * in_y * k_z * batch)?, x: in_x, y: in_y, z: k_z };
    let kernel = args.buf(1, k_x * k_y * k_z * k_w)?;

    for b in 0..batch {
        for oc in 0..k_w {
            for oy in 0..out_y {
                for ox in 0..out_x {
                    let mut sum = 0.0;
                    for c in 0..k_z {
                        for j in 0..k_y {
                            let dy = oy as isize - pad_y + j as isize;
                            if dy < 0 || dy % dilation != 0 {
                                continue;
                            }
                            for i in 0..k_x {
                                let dx = ox as isize - pad_x + i as isize;
                                if dx < 0 || dx % dilation != 0 {
                                    continue;
                                }
                                sum += input.at(b, c, dy / dilation, dx / dilation)
                                    * kernel[((oc * k_z + c) * k_y + j) * k_x + i];
                            }
                        }
                    }
                    out[((b * k_w + oc) * out_y + oy) * out_x + ox] += sum;
                }
            }
        }
    }
    args.put(2, out);
    Ok(())
}

pub fn convolution_weight_grad(args: &mut HostArgs) -> Result<()> {
    let in_x = args.extent(3)?;
    let in_y = args.extent(4)?;
    let out_x = args.extent(5)?;
    let out_y = args.extent(6)?;
    let k_x = args.extent(7)?;
    let k_y = args.extent(8)?;
    let k_z = args.extent(9)?;
    let k_w = args.extent(10)?;
    let pad = args.extent(11)? as isize;
    let stride = args.extent(12)?;
    let batch = args.extent(13)?;

    let mut dk = args.take(2, k_x * k_y * k_z * k_w)?;
    let input = Planes { data: args.buf(0, in_x * in_y * k_z * batch)?, x: in_x, y: in_y, z: k_z };
    let dy = args.buf(1, out_x * out_y * k_w * batch)?;

    for oc in 0..k_w {
        for c in 0..k_z {
            for j in 0..k_y {
                for i in 0..k_x {
                    let mut sum = 0.0;
                    for b in 0..batch {
                        for oy in 0..out_y {
                            let iy = (oy * stride + j) as isize - pad;
                            for ox in 0..out_x {
                                let ix = (ox * stride + i) as isize - pad;
                                sum += input.at(b, c, iy, ix) * dy[((b * k_w + oc) * out_y + oy) * out_x + ox];
                            }
                        }
                    }
                    dk[((oc * k_z + c) * k_y + j) * k_x + i] += sum;
                }
            }
        }
    }
    args.put(2, dk);
    Ok(())
}

/// Rotates every kernel plane by 180 degrees and swaps the input/output
/// channel axes.
pub fn rotate_and_reorder(args: &mut HostArgs) -> Result<()> {
    let k_x = args.extent(2)?;
    let k_y = args.extent(3)?;
    let k_z = args.extent(4)?;
    let k_w = args.extent(5)?;
    let n = k_x * k_y * k_z * k_w;
    let mut out = args.take(1, n)?;
    let kernel = args.buf(0, n)?;
    for oc in 0..k_w {
        for c in 0..k_z {
            for j in 0..k_y {
                for i in 0..k_x {
                    let dst = ((c * k_w + oc) * k_y + (k_y - 1 - j)) * k_x + (k_x - 1 - i);
                    out[dst] = kernel[((oc * k_z + c) * k_y + j) * k_x + i];
                }
            }
        }
    }
    args.put(1, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{buf, int, test_args};
    use super::*;

    #[test]
    fn output_extent_formula() {
        assert_eq!(conv_output_extent(28, 3, 0, 1), Some(26));
        assert_eq!(conv_output_extent(28, 3, 1, 1), Some(28));
        assert_eq!(conv_output_extent(7, 3, 0, 2), Some(3));
        assert_eq!(conv_output_extent(2, 5, 1, 1), None);
    }

    #[test]
    fn single_channel_valid_convolution() {
        // 3x3 input, 2x2 kernel summing its window.
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let mut args = test_args(vec![
            buf(&input),
            buf(&[1.0; 4]),
            buf(&[0.0; 4]),
            int(3), int(3), int(2), int(2), int(1), int(1), int(0), int(1), int(1),
        ]);
        convolution(&mut args).unwrap();
        assert_eq!(args.buf(2, 4).unwrap(), &[12.0, 16.0, 24.0, 28.0]);
    }

    /// Input gradient via rotate + dilated accumulate matches the direct
    /// scatter of the forward definition, with stride and padding.
    #[test]
    fn rotated_kernel_propagates_input_gradient() {
        let (in_x, in_y, k_x, k_y, k_z, k_w, pad, stride) = (5usize, 4usize, 3usize, 2usize, 2usize, 3usize, 1usize, 2usize);
        let out_x = conv_output_extent(in_x, k_x, pad, stride).unwrap();
        let out_y = conv_output_extent(in_y, k_y, pad, stride).unwrap();
        let kernel: Vec<f32> = (0..k_x * k_y * k_z * k_w).map(|v| (v as f32 * 0.37).sin()).collect();
        let dy: Vec<f32> = (0..out_x * out_y * k_w).map(|v| (v as f32 * 0.91).cos()).collect();

        let mut expected = vec![0.0f32; in_x * in_y * k_z];
        for oc in 0..k_w {
            for oy in 0..out_y {
                for ox in 0..out_x {
                    for c in 0..k_z {
                        for j in 0..k_y {
                            for i in 0..k_x {
                                let iy = (oy * stride + j) as isize - pad as isize;
                                let ix = (ox * stride + i) as isize - pad as isize;
                                if iy < 0 || ix < 0 || iy as usize >= in_y || ix as usize >= in_x {
                                    continue;
                                }
                                expected[(c * in_y + iy as usize) * in_x + ix as usize] +=
                                    dy[(oc * out_y + oy) * out_x + ox] * kernel[((oc * k_z + c) * k_y + j) * k_x + i];
                            }
                        }
                    }
                }
            }
        }

        let mut args = test_args(vec![
            buf(&kernel),
            buf(&vec![0.0; kernel.len()]),
            int(k_x as i32), int(k_y as i32), int(k_z as i32), int(k_w as i32),
        ]);
        rotate_and_reorder(&mut args).unwrap();
        let rotated = args.buf(1, kernel.len()).unwrap().to_vec();

        let mut args = test_args(vec![
            buf(&dy),
            buf(&rotated),
            buf(&vec![0.0; expected.len()]),
            int(out_x as i32), int(out_y as i32),
            int(k_x as i32), int(k_y as i32), int(k_w as i32), int(k_z as i32),
            int(k_x as i32 - 1 - pad as i32), int(k_y as i32 - 1 - pad as i32),
            int(stride as i32),
            int(in_x as i32), int(in_y as i32), int(1),
        ]);
        convolution_add(&mut args).unwrap();
        let got = args.buf(2, expected.len()).unwrap();
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-4, "{g} vs {e}");
        }
    }

    #[test]
    fn weight_grad_correlates_input_with_output_grad() {
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let mut args = test_args(vec![
            buf(&input),
            buf(&[1.0, 0.0, 0.0, 1.0]),
            buf(&[0.5; 4]),
            int(3), int(3), int(2), int(2), int(2), int(2), int(1), int(1), int(0), int(1), int(1),
        ]);
        convolution_weight_grad(&mut args).unwrap();
        // dk[j][i] = in[j][i] + in[1+j][1+i]
        assert_eq!(args.buf(2, 4).unwrap(), &[6.5, 8.5, 12.5, 14.5]);
    }
}
