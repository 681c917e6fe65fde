use super::HostArgs;
use crate::error::{NnError, Result};

/// Pooled extent along one axis; `pad` extends the far edge only.
pub fn pool_output_extent(input: usize, size: usize, pad: usize, stride: usize) -> Option<usize> {
    let padded = input + pad;
    if stride == 0 || size == 0 || padded < size {
        return None;
    }
    Some((padded - size) / stride + 1)
}

struct PoolDims {
    in_x: usize,
    in_y: usize,
    planes: usize,
    stride: usize,
    size: usize,
    out_x: usize,
    out_y: usize,
}

impl PoolDims {
    /// Reads the seven scalars starting at argument `first`.
    fn read(args: &HostArgs, first: usize) -> Result<Self> {
        let in_x = args.extent(first)?;
        let in_y = args.extent(first + 1)?;
        let planes = args.extent(first + 2)?;
        let stride = args.extent(first + 3)?;
        let pad_x = args.extent(first + 4)?;
        let pad_y = args.extent(first + 5)?;
        let size = args.extent(first + 6)?;
        let (Some(out_x), Some(out_y)) = (
            pool_output_extent(in_x, size, pad_x, stride),
            pool_output_extent(in_y, size, pad_y, stride),
        ) else {
            return Err(NnError::Device(format!(
                "pooling {in_x}x{in_y} with window {size} and stride {stride} has no output"
            )));
        };
        Ok(Self { in_x, in_y, planes, stride, size, out_x, out_y })
    }

    fn input_len(&self) -> usize {
        self.in_x * self.in_y * self.planes
    }

    fn output_len(&self) -> usize {
        self.out_x * self.out_y * self.planes
    }

    /// Output positions along one axis whose window covers input position `p`.
    fn windows(&self, p: usize, out_len: usize) -> std::ops::Range<usize> {
        let first = (p + 1).saturating_sub(self.size).div_ceil(self.stride);
        let last = (p / self.stride + 1).min(out_len);
        first..last.max(first)
    }

    /// Index of the first maximum inside window (ox, oy) of `plane`; the
    /// window is clipped to the input.
    fn argmax(&self, input: &[f32], plane: usize, ox: usize, oy: usize) -> Option<usize> {
        let base = plane * self.in_x * self.in_y;
        let mut best: Option<usize> = None;
        for y in oy * self.stride..(oy * self.stride + self.size).min(self.in_y) {
            for x in ox * self.stride..(ox * self.stride + self.size).min(self.in_x) {
                let i = base + y * self.in_x + x;
                if best.map_or(true, |b| input[i] > input[b]) {
                    best = Some(i);
                }
            }
        }
        best
    }
}

pub fn max_pooling(args: &mut HostArgs) -> Result<()> {
    let dims = PoolDims::read(args, 2)?;
    let mut out = args.take(1, dims.output_len())?;
    let input = args.buf(0, dims.input_len())?;
    for plane in 0..dims.planes {
        for oy in 0..dims.out_y {
            for ox in 0..dims.out_x {
                let value = dims.argmax(input, plane, ox, oy).map_or(0.0, |i| input[i]);
                out[(plane * dims.out_y + oy) * dims.out_x + ox] = value;
            }
        }
    }
    args.put(1, out);
    Ok(())
}

/// Each input element gathers the output gradients of every window whose
/// maximum it is.
pub fn max_pooling_grad(args: &mut HostArgs) -> Result<()> {
    let dims = PoolDims::read(args, 3)?;
    let mut dx = args.take(2, dims.input_len())?;
    let input = args.buf(0, dims.input_len())?;
    let dy = args.buf(1, dims.output_len())?;
    for plane in 0..dims.planes {
        for y in 0..dims.in_y {
            for x in 0..dims.in_x {
                let i = (plane * dims.in_y + y) * dims.in_x + x;
                let mut sum = 0.0;
                for oy in dims.windows(y, dims.out_y) {
                    for ox in dims.windows(x, dims.out_x) {
                        if dims.argmax(input, plane, ox, oy) == Some(i) {
                            sum += dy[(plane * dims.out_y + oy) * dims.out_x + ox];
                        }
                    }
                }
                dx[i] += sum;
            }
        }
    }
    args.put(2, dx);
    Ok(())
}
