use super::HostArgs;
use crate::error::Result;

pub fn copy(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(2)?;
    let mut out = args.take(1, n)?;
    out[..n].copy_from_slice(args.buf(0, n)?);
    args.put(1, out);
    Ok(())
}

pub fn copy_add(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(2)?;
    let mut out = args.take(1, n)?;
    for (o, x) in out.iter_mut().zip(args.buf(0, n)?) {
        *o += x;
    }
    args.put(1, out);
    Ok(())
}

pub fn add(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(3)?;
    let mut out = args.take(2, n)?;
    let a = args.buf(0, n)?;
    let b = args.buf(1, n)?;
    for i in 0..n {
        out[i] = a[i] + b[i];
    }
    args.put(2, out);
    Ok(())
}

pub fn elem_wise_product(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(3)?;
    let mut out = args.take(2, n)?;
    let a = args.buf(0, n)?;
    let b = args.buf(1, n)?;
    for i in 0..n {
        out[i] = a[i] * b[i];
    }
    args.put(2, out);
    Ok(())
}

/// dx += a * dy
pub fn elem_wise_product_add(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(3)?;
    let mut dx = args.take(2, n)?;
    let a = args.buf(0, n)?;
    let dy = args.buf(1, n)?;
    for i in 0..n {
        dx[i] += a[i] * dy[i];
    }
    args.put(2, dx);
    Ok(())
}

pub fn subtract_from_const(args: &mut HostArgs) -> Result<()> {
    let constant = args.float(2)?;
    let n = args.extent(3)?;
    let mut out = args.take(1, n)?;
    for (o, a) in out.iter_mut().zip(args.buf(0, n)?) {
        *o = constant - a;
    }
    args.put(1, out);
    Ok(())
}

pub fn subtract_from_const_grad(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(2)?;
    let mut dx = args.take(1, n)?;
    for (d, g) in dx.iter_mut().zip(args.buf(0, n)?) {
        *d -= g;
    }
    args.put(1, dx);
    Ok(())
}

/// c[r, j] = a[r, j] + bias[j]
pub fn add_to_matrix(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(3)?;
    let rows = args.extent(4)?;
    let n = cols * rows;
    let mut out = args.take(2, n)?;
    let a = args.buf(0, n)?;
    let bias = args.buf(1, cols)?;
    for i in 0..n {
        out[i] = a[i] + bias[i % cols];
    }
    args.put(2, out);
    Ok(())
}

pub fn add_to_matrix_grad(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(2)?;
    let rows = args.extent(3)?;
    let mut dbias = args.take(1, cols)?;
    let dy = args.buf(0, cols * rows)?;
    for r in 0..rows {
        for j in 0..cols {
            dbias[j] += dy[r * cols + j];
        }
    }
    args.put(1, dbias);
    Ok(())
}

/// c[b, ch, p] = a[b, ch, p] + bias[ch]
pub fn add_to_image_tensor(args: &mut HostArgs) -> Result<()> {
    let plane = args.extent(3)?;
    let channels = args.extent(4)?;
    let batch = args.extent(5)?;
    let n = plane * channels * batch;
    let mut out = args.take(2, n)?;
    let a = args.buf(0, n)?;
    let bias = args.buf(1, channels)?;
    for i in 0..n {
        out[i] = a[i] + bias[(i / plane) % channels];
    }
    args.put(2, out);
    Ok(())
}

pub fn add_to_image_tensor_grad(args: &mut HostArgs) -> Result<()> {
    let plane = args.extent(2)?;
    let channels = args.extent(3)?;
    let batch = args.extent(4)?;
    let mut dbias = args.take(1, channels)?;
    let dy = args.buf(0, plane * channels * batch)?;
    for b in 0..batch {
        for ch in 0..channels {
            let start = (b * channels + ch) * plane;
            dbias[ch] += dy[start..start + plane].iter().sum::<f32>();
        }
    }
    args.put(1, dbias);
    Ok(())
}

struct SplitDims {
    tile: usize,
    out_x: usize,
    out_y: usize,
    in_x: usize,
    in_y: usize,
    in_z: usize,
    in_w: usize,
}

impl SplitDims {
    fn read(args: &HostArgs) -> Result<Self> {
        Ok(Self {
            tile: args.extent(2)?,
            out_x: args.extent(3)?,
            out_y: args.extent(4)?,
            in_x: args.extent(5)?,
            in_y: args.extent(6)?,
            in_z: args.extent(7)?,
            in_w: args.extent(8)?,
        })
    }

    /// Calls `f(tile_index, source_index)` for every tile element that lies
    /// inside the source plane.
    fn for_each(&self, mut f: impl FnMut(usize, usize)) {
        let tiles_x = self.in_x.div_ceil(self.out_x.max(1)).max(1);
        let origin_x = (self.tile % tiles_x) * self.out_x;
        let origin_y = (self.tile / tiles_x) * self.out_y;
        for plane in 0..self.in_z * self.in_w {
            for y in 0..self.out_y {
                let sy = origin_y + y;
                if sy >= self.in_y {
                    continue;
                }
                for x in 0..self.out_x {
                    let sx = origin_x + x;
                    if sx >= self.in_x {
                        continue;
                    }
                    let dst = (plane * self.out_y + y) * self.out_x + x;
                    let src = (plane * self.in_y + sy) * self.in_x + sx;
                    f(dst, src);
                }
            }
        }
    }
}

/// Copies tile `tile` of the input plane into the output; cells past the
/// input edge are zero.
pub fn split_data(args: &mut HostArgs) -> Result<()> {
    let dims = SplitDims::read(args)?;
    let planes = dims.in_z * dims.in_w;
    let mut out = args.take(1, dims.out_x * dims.out_y * planes)?;
    out.fill(0.0);
    let input = args.buf(0, dims.in_x * dims.in_y * planes)?;
    dims.for_each(|dst, src| out[dst] = input[src]);
    args.put(1, out);
    Ok(())
}

pub fn split_data_grad(args: &mut HostArgs) -> Result<()> {
    let dims = SplitDims::read(args)?;
    let planes = dims.in_z * dims.in_w;
    let mut dx = args.take(1, dims.in_x * dims.in_y * planes)?;
    let dy = args.buf(0, dims.out_x * dims.out_y * planes)?;
    dims.for_each(|dst, src| dx[src] += dy[dst]);
    args.put(1, dx);
    Ok(())
}

/// Diagnostic: appends `id` to a log whose first element is the entry count.
pub fn append_id(args: &mut HostArgs) -> Result<()> {
    let id = args.float(1)?;
    let mut log = args.take(0, 1)?;
    let count = log[0] as usize;
    if let Some(slot) = log.get_mut(count + 1) {
        *slot = id;
        log[0] += 1.0;
    }
    args.put(0, log);
    Ok(())
}
