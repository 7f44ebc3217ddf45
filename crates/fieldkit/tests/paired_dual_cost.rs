use std::collections::BTreeMap;

use fieldkit::{BacktrackingGradientDescent, LearningMethod, Trainer};
use fieldkit_model::LogLinearModel;
use fieldkit_utils::Tensor;

/// A small image-segmentation-style grid MRF: each pixel is a binary
/// foreground/background label, its unary feature is the pixel's (fake)
/// intensity, and every 4-neighbor edge carries a constant smoothness
/// feature. Stands in for the spec's 10x10 grids at a size a unit test
/// can afford.
fn grid_model(side: usize, seed: u64) -> (LogLinearModel, BTreeMap<usize, i64>) {
    let mut model = LogLinearModel::new();
    let mut labels = BTreeMap::new();
    let idx = |r: usize, c: usize| r * side + c;

    for r in 0..side {
        for c in 0..side {
            let v = idx(r, c);
            model.declare_variable(v, 2).unwrap();
            let intensity = ((seed + v as u64) % 7) as f64 / 7.0;
            model.set_unary_features(v, vec![1.0, intensity]).unwrap();
            labels.insert(v, if intensity > 0.5 { 1 } else { 0 });
        }
    }
    for r in 0..side {
        for c in 0..side {
            let v = idx(r, c);
            if c + 1 < side {
                let u = idx(r, c + 1);
                model.set_edge_features((v, u), vec![1.0]).unwrap();
                model.set_edge_factor((v, u), Tensor::zeros((2, 2))).unwrap();
            }
            if r + 1 < side {
                let u = idx(r + 1, c);
                model.set_edge_features((v, u), vec![1.0]).unwrap();
                model.set_edge_factor((v, u), Tensor::zeros((2, 2))).unwrap();
            }
        }
    }
    (model, labels)
}

fn build_trainer(method: LearningMethod) -> Trainer {
    let mut trainer = Trainer::new(method).with_tolerances(1e-6, 50);
    for seed in [1u64, 2, 3] {
        let (model, labels) = grid_model(4, seed);
        trainer.add_example(model, labels).unwrap();
    }
    trainer
}

#[test]
fn paired_dual_uses_a_smaller_inner_iteration_budget_than_subgradient() {
    let subgradient = build_trainer(LearningMethod::Subgradient);
    let paired_dual = build_trainer(LearningMethod::PairedDual { inner_iterations: 3 });

    let layout = subgradient.weight_layout().unwrap();
    let subgradient_budget = subgradient.inner_iteration_budget();
    let paired_dual_budget = paired_dual.inner_iteration_budget();

    assert_eq!(layout, paired_dual.weight_layout().unwrap());
    assert!(
        paired_dual_budget < subgradient_budget,
        "paired-dual ({paired_dual_budget}) should run a smaller per-call BP budget than subgradient ({subgradient_budget})"
    );
}

#[test]
fn both_methods_converge_to_finite_weights_under_the_same_outer_budget() {
    let mut subgradient = build_trainer(LearningMethod::Subgradient);
    let mut paired_dual = build_trainer(LearningMethod::PairedDual { inner_iterations: 3 });

    let w0 = subgradient.random_initial_weights().unwrap();
    let minimizer = BacktrackingGradientDescent {
        max_iter: 5,
        ..Default::default()
    };

    let w_sub = subgradient.train_with(&minimizer, w0.clone(), None).unwrap();
    let w_dual = paired_dual.train_with(&minimizer, w0, None).unwrap();

    assert!(w_sub.iter().all(|x| x.is_finite()));
    assert!(w_dual.iter().all(|x| x.is_finite()));
}
