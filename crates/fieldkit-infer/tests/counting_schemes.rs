use std::collections::BTreeMap;

use fieldkit_infer::{BeliefPropagator, CountingNumbers, DisplayMode};
use fieldkit_model::MarkovNet;
use fieldkit_utils::Tensor;

/// Five-node loopy graph: cardinalities `[4,3,6,2,5]`, edges
/// `{(0,1),(1,2),(2,3),(0,3),(0,4)}`, deterministic seeded-looking factors.
fn loopy_graph() -> MarkovNet {
    let cards = [4usize, 3, 6, 2, 5];
    let mut mn = MarkovNet::new();
    for (v, &k) in cards.iter().enumerate() {
        mn.declare_variable(v, k).unwrap();
        let phi: Vec<f64> = (0..k).map(|s| 0.1 * (v as f64 + 1.0) * (s as f64 + 1.0)).collect();
        mn.set_unary_factor(v, phi).unwrap();
    }
    for &(u, v) in &[(0, 1), (1, 2), (2, 3), (0, 3), (0, 4)] {
        let ku = cards[u];
        let kv = cards[v];
        let mut psi = Tensor::zeros((ku, kv));
        for a in 0..ku {
            for b in 0..kv {
                psi[[a, b]] = 0.05 * ((a + b) as f64 + 1.0) - 0.02 * (a as f64) * (b as f64);
            }
        }
        mn.set_edge_factor((u, v), psi).unwrap();
    }
    mn.create_matrices().unwrap();
    mn
}

#[test]
fn trbp_and_convex_with_matching_counting_numbers_agree() {
    let mn = loopy_graph();
    let topology = mn.topology().unwrap();
    let edge_appearance = vec![0.75, 0.75, 0.75, 0.75, 1.0];

    let trbp = CountingNumbers::trbp(&topology, &edge_appearance).unwrap();
    let c_vars: Vec<f64> = (0..topology.num_vars).map(|v| trbp.var_count(v)).collect();
    let convex = CountingNumbers::convex(&topology, edge_appearance.clone(), c_vars).unwrap();

    let mv = mn.matrices().unwrap();
    let (unary, edge_pot) = (mv.unary.clone(), mv.edge_pot.clone());

    let mut bp_trbp = BeliefPropagator::new(topology.clone(), trbp);
    let mut bp_convex = BeliefPropagator::new(topology.clone(), convex);

    bp_trbp.infer(&unary, &edge_pot, 1e-10, 500, DisplayMode::Off).unwrap();
    bp_convex.infer(&unary, &edge_pot, 1e-10, 500, DisplayMode::Off).unwrap();

    for v in 0..topology.num_vars {
        let b1 = bp_trbp.belief(v);
        let b2 = bp_convex.belief(v);
        for (x, y) in b1.iter().zip(b2.iter()) {
            assert!((x - y).abs() < 1e-8, "beliefs diverged for variable {v}: {x} vs {y}");
        }
    }

    let f1 = bp_trbp.energy_functional(&unary, &edge_pot);
    let f2 = bp_convex.energy_functional(&unary, &edge_pot);
    assert!((f1 - f2).abs() < 1e-8);
}

#[test]
fn convex_with_bethe_numbers_reproduces_bethe_exactly() {
    let mn = loopy_graph();
    let topology = mn.topology().unwrap();

    let bethe = CountingNumbers::bethe(&topology).unwrap();
    let c_edges = vec![1.0; topology.num_edges];
    let c_vars: Vec<f64> = topology.degrees.iter().map(|&d| 1.0 - d as f64).collect();
    let convex = CountingNumbers::convex(&topology, c_edges, c_vars).unwrap();

    let mv = mn.matrices().unwrap();
    let (unary, edge_pot) = (mv.unary.clone(), mv.edge_pot.clone());

    let mut bp_bethe = BeliefPropagator::new(topology.clone(), bethe);
    let mut bp_convex = BeliefPropagator::new(topology.clone(), convex);

    bp_bethe.infer(&unary, &edge_pot, 1e-10, 500, DisplayMode::Off).unwrap();
    bp_convex.infer(&unary, &edge_pot, 1e-10, 500, DisplayMode::Off).unwrap();

    for v in 0..topology.num_vars {
        for (x, y) in bp_bethe.belief(v).iter().zip(bp_convex.belief(v).iter()) {
            assert!((x - y).abs() < 1e-8);
        }
    }
}

/// Tree MRF: `0-1-2-3, 2-4`, binary variables. BP with `c_e = c_v = 1`
/// must match exact brute-force marginals on a tree.
fn tree_graph() -> MarkovNet {
    let mut mn = MarkovNet::new();
    for v in 0..5 {
        mn.declare_variable(v, 2).unwrap();
        mn.set_unary_factor(v, vec![0.1 * v as f64, -0.1 * v as f64]).unwrap();
    }
    for &(u, v) in &[(0, 1), (1, 2), (2, 3), (2, 4)] {
        let mut psi = Tensor::zeros((2, 2));
        psi[[0, 0]] = 0.3;
        psi[[1, 1]] = 0.3;
        psi[[0, 1]] = -0.2;
        psi[[1, 0]] = -0.2;
        mn.set_edge_factor((u, v), psi).unwrap();
    }
    mn.create_matrices().unwrap();
    mn
}

fn brute_force_unary_marginal(mn: &MarkovNet, target: usize) -> [f64; 2] {
    let vars: Vec<usize> = (0..5).collect();
    let mut unnormalized = [0.0; 2];
    let mut z = 0.0;

    for mask in 0..(1u32 << vars.len()) {
        let assignment: BTreeMap<usize, usize> = vars
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, ((mask >> i) & 1) as usize))
            .collect();
        let energy = mn.evaluate_state(&assignment).unwrap();
        let weight = energy.exp();
        z += weight;
        unnormalized[assignment[&target]] += weight;
    }

    [unnormalized[0] / z, unnormalized[1] / z]
}

#[test]
fn bp_on_a_tree_matches_brute_force_marginals() {
    let mn = tree_graph();
    let topology = mn.topology().unwrap();
    let c_edges = vec![1.0; topology.num_edges];
    let c_vars = vec![1.0; topology.num_vars];
    let counting = CountingNumbers::convex(&topology, c_edges, c_vars).unwrap();

    let mv = mn.matrices().unwrap();
    let (unary, edge_pot) = (mv.unary.clone(), mv.edge_pot.clone());
    let mut bp = BeliefPropagator::new(topology.clone(), counting);
    bp.infer(&unary, &edge_pot, 1e-12, 200, DisplayMode::Off).unwrap();

    for v in 0..5 {
        let exact = brute_force_unary_marginal(&mn, v);
        let belief = bp.belief(v);
        for s in 0..2 {
            let approx = belief[s].exp();
            assert!(
                (approx - exact[s]).abs() < 1e-3,
                "variable {v} state {s}: bp={approx} exact={exact_s}",
                exact_s = exact[s]
            );
        }
    }
}
