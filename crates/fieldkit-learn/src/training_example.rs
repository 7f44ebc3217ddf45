use std::collections::BTreeMap;

use fieldkit_error::FieldResult;
use fieldkit_infer::{BeliefPropagator, CountingNumbers, DisplayMode};
use fieldkit_model::{LogLinearModel, WeightLayout};

use crate::features::feature_expectation;

/// One training instance: a model (graph structure + features), its
/// observed labels (`None` for a hidden/unobserved variable), and the
/// empirical feature expectation `ŝ` computed once at construction time.
///
/// Partial labels are handled by running belief propagation conditioned
/// on the observed labels (the "label BP", `q`): observed variables are
/// pinned, hidden variables are marginalized, and their posterior beliefs
/// stand in for one-hot labels in the feature expectation.
pub struct TrainingExample {
    pub model: LogLinearModel,
    pub labels: BTreeMap<usize, Option<usize>>,
    pub s_hat: Vec<f64>,
    cached_w: Option<Vec<f64>>,
    cached_mu: Option<Vec<f64>>,
    cached_energy_functional: Option<f64>,
    cached_dual: Option<f64>,
}

impl TrainingExample {
    pub fn new(
        mut model: LogLinearModel,
        labels: BTreeMap<usize, Option<usize>>,
        layout: WeightLayout,
        tol: f64,
        max_iter: usize,
    ) -> FieldResult<Self> {
        model.create_matrices()?;
        let topology = model.topology()?;
        let counting = CountingNumbers::bethe(&topology)?;
        let mut label_bp = BeliefPropagator::new(topology, counting);

        for (&v, &state) in &labels {
            if let Some(s) = state {
                let idx = model
                    .matrices()?
                    .index_of
                    .get(&v)
                    .copied()
                    .expect("labeled variable is declared in the model");
                label_bp.observe(idx, s)?;
            }
        }

        let mv = model.matrices()?;
        label_bp.infer(&mv.unary, &mv.edge_pot, tol, max_iter, DisplayMode::Off)?;
        let s_hat = feature_expectation(&model, &label_bp, layout)?;

        Ok(Self {
            model,
            labels,
            s_hat,
            cached_w: None,
            cached_mu: None,
            cached_energy_functional: None,
            cached_dual: None,
        })
    }

    fn refresh(&mut self, w: &[f64], layout: WeightLayout, tol: f64, max_iter: usize) -> FieldResult<()> {
        if self.cached_w.as_deref() == Some(w) {
            return Ok(());
        }

        self.model.set_weights(w)?;
        let topology = self.model.topology()?;
        let counting = CountingNumbers::bethe(&topology)?;
        let mut model_bp = BeliefPropagator::new(topology, counting);
        let mv = self.model.matrices()?;
        model_bp.infer(&mv.unary, &mv.edge_pot, tol, max_iter, DisplayMode::Off)?;

        let mu = feature_expectation(&self.model, &model_bp, layout)?;
        let energy_functional = model_bp.energy_functional(&mv.unary, &mv.edge_pot);
        let dual = model_bp.dual_objective(&mv.unary, &mv.edge_pot)?;

        self.cached_w = Some(w.to_vec());
        self.cached_mu = Some(mu);
        self.cached_energy_functional = Some(energy_functional);
        self.cached_dual = Some(dual);
        Ok(())
    }

    /// `(μ_i(w), A_i(w))`, the model feature expectation and BP energy
    /// functional at the given weights. Skips re-running inference if `w`
    /// matches the last call's weights.
    pub fn model_expectation(
        &mut self,
        w: &[f64],
        layout: WeightLayout,
        tol: f64,
        max_iter: usize,
    ) -> FieldResult<(Vec<f64>, f64)> {
        self.refresh(w, layout, tol, max_iter)?;
        Ok((
            self.cached_mu.clone().expect("refreshed"),
            self.cached_energy_functional.expect("refreshed"),
        ))
    }

    /// `(μ_i(w), dual objective)` for the paired-dual variant, which runs
    /// inference for a small fixed budget (`max_iter`) rather than to
    /// convergence.
    pub fn model_expectation_dual(
        &mut self,
        w: &[f64],
        layout: WeightLayout,
        tol: f64,
        max_iter: usize,
    ) -> FieldResult<(Vec<f64>, f64)> {
        self.refresh(w, layout, tol, max_iter)?;
        Ok((
            self.cached_mu.clone().expect("refreshed"),
            self.cached_dual.expect("refreshed"),
        ))
    }

    /// EM E-step: re-runs the label BP under the current weights (so
    /// imputed hidden labels reflect the model learned so far) and
    /// snapshots the resulting feature expectation as `ŝ`.
    pub fn refresh_empirical_expectation(
        &mut self,
        w: &[f64],
        layout: WeightLayout,
        tol: f64,
        max_iter: usize,
    ) -> FieldResult<()> {
        self.model.set_weights(w)?;
        let topology = self.model.topology()?;
        let counting = CountingNumbers::bethe(&topology)?;
        let mut label_bp = BeliefPropagator::new(topology, counting);

        for (&v, &state) in &self.labels {
            if let Some(s) = state {
                let idx = self
                    .model
                    .matrices()?
                    .index_of
                    .get(&v)
                    .copied()
                    .expect("labeled variable is declared in the model");
                label_bp.observe(idx, s)?;
            }
        }

        let mv = self.model.matrices()?;
        label_bp.infer(&mv.unary, &mv.edge_pot, tol, max_iter, DisplayMode::Off)?;
        self.s_hat = feature_expectation(&self.model, &label_bp, layout)?;
        self.cached_w = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldkit_utils::Tensor;

    fn toy_model() -> LogLinearModel {
        let mut model = LogLinearModel::new();
        model.declare_variable(0, 2).unwrap();
        model.declare_variable(1, 2).unwrap();
        model.set_unary_features(0, vec![1.0]).unwrap();
        model.set_unary_features(1, vec![1.0]).unwrap();
        model.set_edge_features((0, 1), vec![1.0]).unwrap();
        model.set_edge_factor((0, 1), Tensor::zeros((2, 2))).unwrap();
        model
    }

    #[test]
    fn fully_labeled_example_has_one_hot_empirical_expectation() {
        let model = toy_model();
        let layout = model.weight_layout().unwrap();
        let mut labels = BTreeMap::new();
        labels.insert(0, Some(0));
        labels.insert(1, Some(1));
        let example = TrainingExample::new(model, labels, layout, 1e-8, 50).unwrap();
        // mu_unary layout: [j=0][s=0,1] for var0's feature contributing a one-hot at s=0
        // plus var1's feature contributing a one-hot at s=1 -> both states get mass 1.
        assert!((example.s_hat[0] - 1.0).abs() < 1e-6);
        assert!((example.s_hat[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn partially_labeled_example_still_produces_an_expectation() {
        let model = toy_model();
        let layout = model.weight_layout().unwrap();
        let mut labels = BTreeMap::new();
        labels.insert(0, Some(0));
        labels.insert(1, None);
        let example = TrainingExample::new(model, labels, layout, 1e-8, 50).unwrap();
        assert_eq!(example.s_hat.len(), layout.total_len());
    }

    #[test]
    fn model_expectation_is_cached_across_identical_weight_calls() {
        let model = toy_model();
        let layout = model.weight_layout().unwrap();
        let mut labels = BTreeMap::new();
        labels.insert(0, Some(0));
        labels.insert(1, Some(1));
        let mut example = TrainingExample::new(model, labels, layout, 1e-8, 50).unwrap();
        let w = vec![0.0; layout.total_len()];
        let (mu1, a1) = example.model_expectation(&w, layout, 1e-8, 50).unwrap();
        let (mu2, a2) = example.model_expectation(&w, layout, 1e-8, 50).unwrap();
        assert_eq!(mu1, mu2);
        assert_eq!(a1, a2);
    }
}
