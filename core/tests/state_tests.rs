use l2l::Var;
use l2l::config::AdamConfig;
use l2l::rules::adam_update;
use l2l::state::{HistoryBuffer, inf_norm_normalize, min_max_normalize, recency_order};
use l2l::tensor::Tensor;

fn scalar(v: f32) -> Var {
    Var::new(Tensor::full([1, 1], v))
}

#[test]
fn test_capacity_four_history() {
    let mut history = HistoryBuffer::zeros(&[1], 4, 1).unwrap();
    for v in 1..=5 {
        history.write(&[scalar(v as f32)]).unwrap();
    }

    assert_eq!(history.raw(0).unwrap().value().data(), &[5.0, 2.0, 3.0, 4.0]);
    assert_eq!(
        history.read_recent(0).unwrap().value().data(),
        &[5.0, 4.0, 3.0, 2.0]
    );
}

#[test]
fn test_pointer_cycles_back_after_limit_writes() {
    for limit in 1..6 {
        let mut history = HistoryBuffer::zeros(&[2, 3], limit, 1).unwrap();
        let start = history.ptr();
        let values = [Var::zeros([2, 1]), Var::zeros([3, 1])];
        for _ in 0..limit {
            history.write(&values).unwrap();
        }
        assert_eq!(history.ptr(), start);

        let order = recency_order(history.ptr(), limit);
        assert_eq!(order[0], history.ptr());
        assert_eq!(*order.last().unwrap(), (history.ptr() + 1) % limit);
    }
}

#[test]
fn test_min_max_normalize_bounds() {
    let history = Var::new(
        Tensor::new(
            vec![
                3.0, -1.0, 7.0, 0.5, // mixed
                2.0, 2.0, 2.0, 2.0, // constant
                -1e6, 1e6, 0.0, 1.0, // wide
            ],
            [3, 4],
        )
        .unwrap(),
    );
    let normalized = min_max_normalize(&history).unwrap();
    assert!(
        normalized
            .value()
            .data()
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
    );
    assert_eq!(&normalized.value().data()[4..8], &[0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_inf_norm_handles_zero_rows() {
    let history = Var::new(Tensor::new(vec![0.0, 0.0, -4.0, 2.0], [2, 2]).unwrap());
    let normalized = inf_norm_normalize(&history).unwrap();
    assert_eq!(normalized.value().data(), &[0.0, 0.0, -1.0, 0.5]);
}

#[test]
fn test_adam_first_step_on_square() {
    let config = AdamConfig {
        learning_rate: 0.1,
        beta1: 0.9,
        beta2: 0.999,
        epsilon: 1e-8,
    };
    let x = Tensor::full([1, 1], 10.0);
    let g = Tensor::full([1, 1], 20.0);
    let zeros = Tensor::zeros([1, 1]);
    let update = adam_update(&config, &x, &g, &zeros, &zeros, 1).unwrap();

    assert!((update.m.data()[0] - 2.0).abs() < 1e-5);
    assert!((update.v.data()[0] - 0.4).abs() < 1e-5);
    assert!((update.value.data()[0] - 9.9).abs() < 1e-4);
}
