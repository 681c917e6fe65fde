mod common;

use common::network;
use nngraph_core::nn::{OpId, Operator};
use nngraph_core::{CpuDevice, Network, Shape, TensorId};

const STEPS: usize = 4;

fn producer(net: &Network<CpuDevice>, id: TensorId) -> OpId {
    net.tensor(id).unwrap().producer().unwrap()
}

fn dispatch_counts(net: &Network<CpuDevice>, id: TensorId) -> (usize, usize) {
    let (forward, backward) = net.operator_dispatches(producer(net, id)).unwrap();
    (forward.len(), backward.len())
}

#[test]
fn delayed_operators_run_from_their_offset_to_the_end() {
    let mut net = network();
    let x = net.create_input(Shape::d1(2), STEPS).unwrap();
    let target = net.create_input(Shape::d1(2), STEPS).unwrap();
    let late = net.add_operator(Operator::Copy { time_result: 0 }, &[x], 1).unwrap();
    let loss = net.add_operator(Operator::LeastSquares, &[x, target], 3).unwrap();
    assert_eq!(net.tensor(late).unwrap().seq(), STEPS);
    assert_eq!(net.tensor(late).unwrap().time_offset(), 1);
    assert_eq!(net.tensor(loss).unwrap().seq(), STEPS);
    net.compile(1).unwrap();

    assert_eq!(net.max_sequence(), STEPS);
    assert_eq!(dispatch_counts(&net, late), (STEPS - 1, STEPS - 1));
    assert_eq!(dispatch_counts(&net, loss), (1, 1));

    // step t holds [2t, 2t + 1]
    let data: Vec<f32> = (0..2 * STEPS).map(|v| v as f32).collect();
    net.write_sequence(x, &data, STEPS).unwrap();
    net.forward().unwrap();

    assert_eq!(net.read_tensor(late, 0).unwrap(), vec![0.0, 0.0]);
    for t in 1..STEPS {
        assert_eq!(net.read_tensor(late, t).unwrap(), net.read_tensor(x, t).unwrap());
    }
    for t in 0..3 {
        assert_eq!(net.read_tensor(loss, t).unwrap(), vec![0.0]);
    }
    assert_eq!(net.read_tensor(loss, 3).unwrap(), vec![(36.0 + 49.0) / 2.0]);

    for t in 0..STEPS {
        net.write_gradient(late, t, &[1.0, 1.0]).unwrap();
    }
    net.backward().unwrap();
    assert_eq!(net.read_gradient(x, 0).unwrap(), vec![0.0, 0.0]);
    assert_eq!(net.read_gradient(x, 1).unwrap(), vec![1.0, 1.0]);
    assert_eq!(net.read_gradient(x, 2).unwrap(), vec![1.0, 1.0]);
    assert_eq!(net.read_gradient(x, 3).unwrap(), vec![7.0, 8.0]);
}

#[test]
fn delayed_writes_into_state_land_one_slot_ahead() {
    let mut net = network();
    let x = net.create_input(Shape::d1(2), STEPS).unwrap();
    let s = net.create_state(Shape::d1(2), STEPS).unwrap();
    net.add_operator_into(Operator::Copy { time_result: 1 }, &[x], s, 1).unwrap();
    assert_eq!(net.tensor(s).unwrap().time_offset(), 1);
    net.compile(1).unwrap();
    assert_eq!(dispatch_counts(&net, s), (STEPS - 1, STEPS - 1));

    let data: Vec<f32> = (0..2 * STEPS).map(|v| v as f32).collect();
    net.write_sequence(x, &data, STEPS).unwrap();
    net.forward().unwrap();

    assert_eq!(net.read_tensor(s, 0).unwrap(), vec![0.0, 0.0]);
    assert_eq!(net.read_tensor(s, 1).unwrap(), vec![0.0, 0.0]);
    for t in 1..STEPS {
        assert_eq!(net.read_tensor(s, t + 1).unwrap(), net.read_tensor(x, t).unwrap());
    }
}

#[test]
fn explicit_targets_carry_their_offset_downstream() {
    let mut net = network();
    let x = net.create_input(Shape::d1(2), STEPS).unwrap();
    let s = net.create_state(Shape::d1(2), STEPS).unwrap();
    net.add_operator_into(Operator::Copy { time_result: 1 }, &[x], s, 2).unwrap();
    let read = net.add_operator(Operator::SubtractFromConst(1.0), &[s], 0).unwrap();
    assert_eq!(net.tensor(s).unwrap().time_offset(), 2);
    assert_eq!(net.tensor(read).unwrap().seq(), STEPS + 2);
}
