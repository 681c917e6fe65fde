use super::HostArgs;
use crate::error::Result;

const MIN_PROBABILITY: f32 = 1e-30;

fn label_index(label: f32, cols: usize) -> Option<usize> {
    let index = label as usize;
    (label >= 0.0 && index < cols).then_some(index)
}

/// Row-wise softmax over a `rows × cols` matrix.
pub fn softmax(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(2)?;
    let rows = args.extent(3)?;
    let mut output = args.take(1, cols * rows)?;
    let logits = args.buf(0, cols * rows)?;
    for b in 0..rows {
        let offset = b * cols;
        let logits_batch = &logits[offset..offset + cols];
        let output_batch = &mut output[offset..offset + cols];

        let max_logit = logits_batch.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut sum_exp = 0.0;
        for (i, &logit) in logits_batch.iter().enumerate() {
            let exp_val = (logit - max_logit).exp();
            output_batch[i] = exp_val;
            sum_exp += exp_val;
        }

        for prob in output_batch.iter_mut() {
            *prob /= sum_exp;
        }
    }
    args.put(1, output);
    Ok(())
}

/// `dx += y * (dy - Σ dy·y)` per row.
pub fn softmax_grad(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(3)?;
    let rows = args.extent(4)?;
    let n = cols * rows;
    let mut dx = args.take(2, n)?;
    let dy = args.buf(0, n)?;
    let y = args.buf(1, n)?;
    for r in 0..rows {
        let row = r * cols..(r + 1) * cols;
        let dot: f32 = dy[row.clone()].iter().zip(&y[row.clone()]).map(|(g, p)| g * p).sum();
        for i in row {
            dx[i] += y[i] * (dy[i] - dot);
        }
    }
    args.put(2, dx);
    Ok(())
}

pub fn mean_squared_error(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(3)?;
    let rows = args.extent(4)?;
    let n = cols * rows;
    let mut loss = args.take(2, 1)?;
    let a = args.buf(0, n)?;
    let label = args.buf(1, n)?;
    let sum: f32 = a.iter().zip(label).map(|(x, l)| (x - l) * (x - l)).sum();
    loss[0] = sum / (2.0 * rows.max(1) as f32);
    args.put(2, loss);
    Ok(())
}

pub fn mean_squared_error_grad(args: &mut HostArgs) -> Result<()> {
    let n = args.extent(3)?;
    let rows = args.extent(4)?.max(1) as f32;
    let mut dx = args.take(2, n)?;
    let a = args.buf(0, n)?;
    let label = args.buf(1, n)?;
    for i in 0..n {
        dx[i] += (a[i] - label[i]) / rows;
    }
    args.put(2, dx);
    Ok(())
}

/// Mean negative log-likelihood of the labelled class.
pub fn cross_entropy(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(3)?;
    let rows = args.extent(4)?;
    let mut loss = args.take(2, 1)?;
    let probs = args.buf(0, cols * rows)?;
    let labels = args.buf(1, rows)?;
    let mut total_loss = 0.0;
    for (b, &label) in labels.iter().enumerate() {
        if let Some(class) = label_index(label, cols) {
            total_loss -= probs[b * cols + class].max(MIN_PROBABILITY).ln();
        }
    }
    loss[0] = total_loss / rows.max(1) as f32;
    args.put(2, loss);
    Ok(())
}

pub fn cross_entropy_grad(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(3)?;
    let rows = args.extent(4)?;
    let mut dx = args.take(2, cols * rows)?;
    let probs = args.buf(0, cols * rows)?;
    let labels = args.buf(1, rows)?;
    let scale = rows.max(1) as f32;
    for (b, &label) in labels.iter().enumerate() {
        if let Some(class) = label_index(label, cols) {
            let i = b * cols + class;
            dx[i] -= 1.0 / (scale * probs[i].max(MIN_PROBABILITY));
        }
    }
    args.put(2, dx);
    Ok(())
}

/// Fraction of rows whose argmax equals the label.
pub fn classification_accuracy(args: &mut HostArgs) -> Result<()> {
    let cols = args.extent(3)?;
    let rows = args.extent(4)?;
    let mut out = args.take(2, 1)?;
    let probs = args.buf(0, cols * rows)?;
    let labels = args.buf(1, rows)?;
    let mut correct = 0usize;
    for (b, &label) in labels.iter().enumerate() {
        let row = &probs[b * cols..(b + 1) * cols];
        let mut best = 0;
        for (i, &p) in row.iter().enumerate() {
            if p > row[best] {
                best = i;
            }
        }
        if label_index(label, cols) == Some(best) {
            correct += 1;
        }
    }
    out[0] = correct as f32 / rows.max(1) as f32;
    args.put(2, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{buf, int, test_args};
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut args = test_args(vec![
            buf(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]),
            buf(&[0.0; 6]),
            int(3),
            int(2),
        ]);
        softmax(&mut args).unwrap();
        let out = args.buf(1, 6).unwrap();
        assert!((out[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_then_cross_entropy_grad_is_p_minus_onehot() {
        let probs = [0.2f32, 0.3, 0.5];
        let mut args = test_args(vec![buf(&probs), buf(&[2.0]), buf(&[0.0; 3]), int(3), int(1)]);
        cross_entropy_grad(&mut args).unwrap();
        let dy = args.buf(2, 3).unwrap().to_vec();

        let mut args = test_args(vec![buf(&dy), buf(&probs), buf(&[0.0; 3]), int(3), int(1)]);
        softmax_grad(&mut args).unwrap();
        let dx = args.buf(2, 3).unwrap();
        let expected = [0.2, 0.3, -0.5];
        for (got, want) in dx.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
    }

    #[test]
    fn losses_average_over_rows() {
        let mut args = test_args(vec![
            buf(&[1.0, 2.0, 3.0, 4.0]),
            buf(&[0.0, 2.0, 1.0, 4.0]),
            buf(&[0.0]),
            int(2),
            int(2),
        ]);
        mean_squared_error(&mut args).unwrap();
        assert!((args.buf(2, 1).unwrap()[0] - 1.25).abs() < 1e-6);

        let mut args = test_args(vec![buf(&[0.5, 0.5, 0.25, 0.75]), buf(&[0.0, 1.0]), buf(&[0.0]), int(2), int(2)]);
        cross_entropy(&mut args).unwrap();
        let expected = -(0.5f32.ln() + 0.75f32.ln()) / 2.0;
        assert!((args.buf(2, 1).unwrap()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let mut args = test_args(vec![
            buf(&[0.9, 0.1, 0.2, 0.8, 0.6, 0.4]),
            buf(&[0.0, 1.0, 1.0]),
            buf(&[0.0]),
            int(2),
            int(3),
        ]);
        classification_accuracy(&mut args).unwrap();
        assert!((args.buf(2, 1).unwrap()[0] - 2.0 / 3.0).abs() < 1e-6);
    }
}
