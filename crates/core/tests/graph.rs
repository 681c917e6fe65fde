mod common;

use common::{assert_close, network};
use nngraph_core::backend::{AccessMode, DispatchRequest, KernelArg};
use nngraph_core::nn::{Operator, Padding, WeightInit};
use nngraph_core::{Backend, CpuDevice, LaunchConfig, Network, NnError, Pass, Shape, TensorId};

#[test]
fn dense_layer_matches_host_reference() {
    let mut net = network();
    let x = net.create_input(Shape::d3(784, 1, 1), 1).unwrap();
    let w = net.create_parameter(Shape::d2(10, 784), 1).unwrap();
    let b = net.create_parameter(Shape::d1(10), 1).unwrap();
    let y = net.add_operator(Operator::MatMul, &[x, w], 0).unwrap();
    let out = net.add_operator(Operator::AddBias, &[y, b], 0).unwrap();
    net.compile(4).unwrap();
    assert_eq!(net.shape(out).unwrap(), Shape::new(10, 1, 1, 4));

    let xs: Vec<f32> = (0..4 * 784).map(|i| ((i % 17) as f32 - 8.0) / 16.0).collect();
    let ws: Vec<f32> = (0..784 * 10).map(|i| ((i % 13) as f32 - 6.0) / 100.0).collect();
    let bs: Vec<f32> = (0..10).map(|i| i as f32 * 0.1).collect();
    net.write_tensor(x, 0, &xs).unwrap();
    net.write_tensor(w, 0, &ws).unwrap();
    net.write_tensor(b, 0, &bs).unwrap();
    net.forward().unwrap();

    let mut expected = vec![0.0f32; 40];
    for r in 0..4 {
        for c in 0..10 {
            let dot: f32 = (0..784).map(|k| xs[r * 784 + k] * ws[k * 10 + c]).sum();
            expected[r * 10 + c] = dot + bs[c];
        }
    }
    assert_close(&net.read_tensor(out, 0).unwrap(), &expected, 1e-5);
}

/// Central differences of `loss` against every element of `param`, which
/// must currently hold `values`.
fn numeric_gradient(
    net: &mut Network<CpuDevice>,
    param: TensorId,
    loss: TensorId,
    values: &[f32],
    eps: f32,
) -> Vec<f32> {
    let mut grad = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let mut loss_at = |delta: f32| {
            let mut perturbed = values.to_vec();
            perturbed[i] += delta;
            net.write_tensor(param, 0, &perturbed).unwrap();
            net.forward().unwrap();
            net.read_tensor(loss, 0).unwrap()[0]
        };
        grad.push((loss_at(eps) - loss_at(-eps)) / (2.0 * eps));
    }
    net.write_tensor(param, 0, values).unwrap();
    grad
}

fn assert_gradients_agree(what: &str, numeric: &[f32], analytic: &[f32]) {
    assert_eq!(numeric.len(), analytic.len());
    for (i, (n, a)) in numeric.iter().zip(analytic).enumerate() {
        let scale = n.abs().max(a.abs()).max(1e-2);
        assert!((n - a).abs() / scale < 0.01, "{what}[{i}]: numeric {n}, analytic {a}");
    }
}

#[test]
fn dense_least_squares_gradients_match_finite_differences() {
    let mut net = network();
    let x = net.create_input(Shape::d1(4), 1).unwrap();
    let target = net.create_input(Shape::d1(3), 1).unwrap();
    let w = net.create_parameter(Shape::d2(3, 4), 1).unwrap();
    let b = net.create_parameter(Shape::d1(3), 1).unwrap();
    let y = net.add_operator(Operator::MatMul, &[x, w], 0).unwrap();
    let y = net.add_operator(Operator::AddBias, &[y, b], 0).unwrap();
    let loss = net.add_operator(Operator::LeastSquares, &[y, target], 0).unwrap();
    net.compile(2).unwrap();

    let weights: Vec<f32> = (0..12).map(|i| (i as f32 - 5.0) * 0.1).collect();
    let bias = [0.3, -0.2, 0.1];
    net.write_tensor(x, 0, &[0.5, -1.0, 2.0, 0.25, 1.0, 0.0, -0.5, 1.5]).unwrap();
    net.write_tensor(target, 0, &[1.0, 0.0, -1.0, 0.5, 0.5, 2.0]).unwrap();
    net.write_tensor(w, 0, &weights).unwrap();
    net.write_tensor(b, 0, &bias).unwrap();
    net.forward().unwrap();
    net.backward().unwrap();
    let dw = net.read_gradient(w, 0).unwrap();
    let db = net.read_gradient(b, 0).unwrap();

    assert_gradients_agree("dW", &numeric_gradient(&mut net, w, loss, &weights, 1e-2), &dw);
    assert_gradients_agree("db", &numeric_gradient(&mut net, b, loss, &bias, 1e-2), &db);
}

#[test]
fn conv_pool_gradients_match_finite_differences() {
    let mut net = network();
    let x = net.create_input(Shape::d3(5, 5, 1), 1).unwrap();
    let target = net.create_input(Shape::d3(2, 2, 2), 1).unwrap();
    let k = net.create_parameter(Shape::new(2, 2, 1, 2), 1).unwrap();
    let b = net.create_parameter(Shape::d1(2), 1).unwrap();
    let y = net
        .add_operator(Operator::Conv2d { pad: Padding::Valid, stride: 1 }, &[x, k], 0)
        .unwrap();
    let y = net.add_operator(Operator::AddBiasConv, &[y, b], 0).unwrap();
    let y = net.add_operator(Operator::MaxPool { pad: 0, stride: 2, size: 2 }, &[y], 0).unwrap();
    let loss = net.add_operator(Operator::LeastSquares, &[y, target], 0).unwrap();
    net.compile(1).unwrap();
    assert_eq!(net.shape(y).unwrap(), Shape::new(2, 2, 2, 1));

    // A ramp input and positive kernels keep every pooling maximum in the
    // bottom-right cell of its window, well clear of small perturbations.
    let pixels: Vec<f32> = (0..25).map(|i| i as f32 * 0.1).collect();
    let kernel = [0.1, 0.2, 0.3, 0.4, 0.4, 0.1, 0.2, 0.3];
    let bias = [0.05, -0.1];
    net.write_tensor(x, 0, &pixels).unwrap();
    net.write_tensor(target, 0, &[0.5; 8]).unwrap();
    net.write_tensor(k, 0, &kernel).unwrap();
    net.write_tensor(b, 0, &bias).unwrap();
    net.forward().unwrap();
    net.backward().unwrap();
    let dk = net.read_gradient(k, 0).unwrap();
    let db = net.read_gradient(b, 0).unwrap();
    let dx = net.read_gradient(x, 0).unwrap();
    assert!(dx.iter().any(|g| *g != 0.0));

    assert_gradients_agree("dK", &numeric_gradient(&mut net, k, loss, &kernel, 5e-2), &dk);
    assert_gradients_agree("db", &numeric_gradient(&mut net, b, loss, &bias, 5e-2), &db);
    assert_gradients_agree("dx", &numeric_gradient(&mut net, x, loss, &pixels, 5e-2), &dx);
}

#[test]
fn named_parameters_survive_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.snap");
    let values: Vec<f32> = (0..6).map(|i| i as f32 * 1.5).collect();

    let build = || {
        let mut net = network();
        let w = net.create_parameter(Shape::d2(3, 2), 1).unwrap();
        net.name_tensor(w, "w1").unwrap();
        net.compile(1).unwrap();
        (net, w)
    };

    let (mut first, w) = build();
    first.write_tensor(w, 0, &values).unwrap();
    first.save_snapshot(&path, &[w]).unwrap();

    let (mut second, w) = build();
    assert_eq!(second.read_tensor(w, 0).unwrap(), vec![0.0; 6]);
    second.load_snapshot(&path, &[w]).unwrap();
    assert_eq!(second.read_tensor(w, 0).unwrap(), values);
}

#[test]
fn unnamed_tensors_cannot_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let mut net = network();
    let w = net.create_parameter(Shape::d1(2), 1).unwrap();
    net.compile(1).unwrap();
    let err = net.save_snapshot(dir.path().join("w.snap"), &[w]).unwrap_err();
    assert!(matches!(err, NnError::Graph(_)));
}

#[test]
fn split_yields_one_tile_per_timestep() {
    let mut net = network();
    let image = net.create_input(Shape::d3(28, 28, 1), 1).unwrap();
    let tiles = net.add_operator(Operator::Split { tile_x: 7, tile_y: 7 }, &[image], 0).unwrap();
    assert_eq!(net.tensor(tiles).unwrap().seq(), 16);
    net.compile(1).unwrap();
    assert_eq!(net.max_sequence(), 16);

    let pixels: Vec<f32> = (0..28 * 28).map(|i| i as f32).collect();
    net.write_tensor(image, 0, &pixels).unwrap();
    net.forward().unwrap();

    let top_left: Vec<f32> = (0..7).flat_map(|y| (0..7).map(move |x| (y * 28 + x) as f32)).collect();
    assert_eq!(net.read_tensor(tiles, 0).unwrap(), top_left);
    let second: Vec<f32> = (0..7).flat_map(|y| (7..14).map(move |x| (y * 28 + x) as f32)).collect();
    assert_eq!(net.read_tensor(tiles, 1).unwrap(), second);
    let last = net.read_tensor(tiles, 15).unwrap();
    assert_eq!(last[48], (27 * 28 + 27) as f32);
}

#[test]
fn cursors_are_rewound_after_compile() {
    let mut net = network();
    let image = net.create_input(Shape::d3(4, 4, 1), 1).unwrap();
    let tiles = net.add_operator(Operator::Split { tile_x: 2, tile_y: 2 }, &[image], 0).unwrap();
    let doubled = net.add_operator(Operator::Add { time_result: 0 }, &[tiles, tiles], 0).unwrap();
    net.compile(1).unwrap();
    assert_eq!(net.tensor(tiles).unwrap().cursor(), 0);
    assert_eq!(net.tensor(doubled).unwrap().cursor(), 0);
    assert_eq!(net.tensor(doubled).unwrap().seq(), 4);
}

#[test]
fn losses_and_metrics_stay_scalar_after_batching() {
    let mut net = network();
    let x = net.create_input(Shape::d1(3), 1).unwrap();
    let labels = net.create_input(Shape::d1(1), 1).unwrap();
    let probs = net.add_operator(Operator::Softmax, &[x], 0).unwrap();
    let loss = net.add_operator(Operator::CrossEntropy, &[probs, labels], 0).unwrap();
    let accuracy = net.add_operator(Operator::Accuracy, &[probs, labels], 0).unwrap();
    net.compile(4).unwrap();

    assert_eq!(net.shape(probs).unwrap(), Shape::new(3, 1, 1, 4));
    assert_eq!(net.shape(labels).unwrap(), Shape::new(1, 1, 1, 4));
    assert_eq!(net.shape(loss).unwrap(), Shape::d1(1));
    assert_eq!(net.shape(accuracy).unwrap(), Shape::d1(1));

    net.write_tensor(x, 0, &[5.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 5.0, 5.0, 0.0, 0.0]).unwrap();
    net.write_tensor(labels, 0, &[0.0, 1.0, 2.0, 1.0]).unwrap();
    net.forward().unwrap();
    assert_eq!(net.read_tensor(accuracy, 0).unwrap(), vec![0.75]);
    assert_eq!(net.read_tensor(loss, 0).unwrap().len(), 1);
}

fn scratch_of(order: [(usize, usize); 2]) -> usize {
    let mut net = network();
    for (rows, cols) in order {
        let x = net.create_input(Shape::d1(rows), 1).unwrap();
        let w = net.create_parameter(Shape::d2(cols, rows), 1).unwrap();
        net.add_operator(Operator::MatMul, &[x, w], 0).unwrap();
    }
    net.compile(1).unwrap();
    assert_eq!(net.scratch_tensors().len(), 1);
    let id = net.scratch_tensors()[0];
    net.shape(id).unwrap().elements()
}

#[test]
fn shared_scratch_is_sized_for_the_largest_request() {
    // 100 = 100 × 1 weights, 250 = 125 × 2 weights
    assert_eq!(scratch_of([(100, 1), (125, 2)]), 250);
    assert_eq!(scratch_of([(125, 2), (100, 1)]), 250);
}

#[test]
fn valid_convolution_shrinks_each_plane() {
    let mut net = network();
    let x = net.create_input(Shape::d3(28, 28, 1), 1).unwrap();
    let k = net.create_parameter(Shape::new(3, 3, 1, 32), 1).unwrap();
    net.init_weight(k, WeightInit::Constant(1.0)).unwrap();
    let y = net
        .add_operator(Operator::Conv2d { pad: Padding::Valid, stride: 1 }, &[x, k], 0)
        .unwrap();
    net.compile(2).unwrap();
    assert_eq!(net.shape(y).unwrap(), Shape::new(26, 26, 32, 2));

    net.write_tensor(x, 0, &vec![1.0; 28 * 28 * 2]).unwrap();
    net.forward().unwrap();
    let out = net.read_tensor(y, 0).unwrap();
    assert_eq!(out.len(), 26 * 26 * 32 * 2);
    assert!(out.iter().all(|v| (v - 9.0).abs() < 1e-5));
}

#[test]
fn backward_dispatches_replay_last_first() {
    let mut backend = Backend::new(CpuDevice::new(), common::registry());
    let log = backend.create_buffer(4 * 8, AccessMode::ReadWrite, 1).unwrap();
    for id in 1..=5 {
        let request = DispatchRequest::new(
            "AppendId",
            vec![log.into(), KernelArg::float(id as f32)],
            LaunchConfig::single(),
        );
        backend.submit(request, Pass::Backward).unwrap();
    }
    backend.run(Pass::Backward).unwrap();
    let mut out = [0.0f32; 6];
    backend.read_f32(log, 0, &mut out).unwrap();
    assert_eq!(out, [5.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
}

#[test]
fn sub_buffers_start_on_alignment_boundaries() {
    let device = CpuDevice::with_alignment(16).unwrap();
    let mut backend = Backend::new(device, common::registry());
    let base = backend.create_buffer(13, AccessMode::ReadWrite, 2).unwrap();
    let second = backend.create_sub_buffer(base, 13, AccessMode::ReadWrite, 1).unwrap();
    assert_eq!(backend.buffer_offset(second).unwrap(), 16);
}

#[test]
fn runtime_before_compile_is_a_usage_error() {
    let mut net = network();
    let x = net.create_input(Shape::d1(3), 1).unwrap();
    assert_eq!(net.forward().unwrap_err().to_string(), "usage error: graph not initialized");
    assert!(matches!(net.write_tensor(x, 0, &[0.0; 3]), Err(NnError::UsageSequence(_))));
    assert!(matches!(net.batch_done(), Err(NnError::UsageSequence(_))));

    net.compile(1).unwrap();
    assert!(matches!(
        net.add_operator(Operator::Softmax, &[x], 0),
        Err(NnError::UsageSequence(_))
    ));
    assert!(matches!(net.write_tensor(x, 0, &[0.0; 4]), Err(NnError::Range(_))));
}
