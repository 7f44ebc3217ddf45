use fieldkit_error::FieldResult;
use fieldkit_infer::BeliefPropagator;
use fieldkit_model::{LogLinearModel, WeightLayout};

/// Computes the sufficient-statistics vector `μ = concat(vec(μ_unary), vec(μ_edge))`
/// from a propagator's current beliefs, in the same flat layout as the
/// model's weight vector `w`. Used both for the model expectation `μ_i(w)`
/// (unconditioned BP) and the empirical expectation `ŝ_i` (label BP,
/// conditioned on observed labels) — the two differ only in which
/// propagator's beliefs are read.
pub fn feature_expectation(
    model: &LogLinearModel,
    bp: &BeliefPropagator,
    layout: WeightLayout,
) -> FieldResult<Vec<f64>> {
    let k = layout.k;
    let mut mu_unary = vec![0.0; layout.d_u * k];
    for v in model.variables() {
        let idx = model
            .matrices()?
            .index_of
            .get(&v)
            .copied()
            .expect("variable present in matrix view");
        let belief = bp.belief(idx);
        if let Some(f) = model.unary_features(v) {
            for (j, &fj) in f.iter().enumerate() {
                for s in 0..k {
                    mu_unary[j * k + s] += fj * belief[s].exp();
                }
            }
        }
    }

    let mut mu_edge = vec![0.0; layout.d_e * k * k];
    for (e, &(u, v)) in model.matrices()?.topology.forward_pairs.iter().enumerate() {
        let pair = bp.pairwise_belief(e);
        if let Some(f) = model.edge_features((u, v)) {
            for (j, &fj) in f.iter().enumerate() {
                for ab in 0..k * k {
                    mu_edge[j * k * k + ab] += fj * pair[ab].exp();
                }
            }
        }
    }

    let mut mu = mu_unary;
    mu.extend(mu_edge);
    Ok(mu)
}
