use std::collections::BTreeMap;

use fieldkit_error::FieldResult;
use fieldkit_learn::{BacktrackingGradientDescent, IterateLog, Learner, LearningMethod, Minimizer, Regularization};
use fieldkit_model::{LogLinearModel, WeightLayout};
use fieldkit_utils::random::gaussian_vec;

/// Thin composition layer with no algorithmic content of its own: builds a
/// [`Learner`] of the desired variant, accepts one training example at a
/// time in whatever partial-label shape an external caller already has
/// (a sentinel integer marking a hidden variable, rather than `Option`),
/// and drives `learn` with randomly initialized weights.
///
/// Everything here delegates to `fieldkit-learn`; no inference or
/// optimization logic lives in this crate.
pub struct Trainer {
    learner: Learner,
    hidden_sentinel: i64,
    method: LearningMethod,
    max_iter: usize,
}

impl Trainer {
    pub fn new(method: LearningMethod) -> Self {
        Self {
            learner: Learner::new(method),
            hidden_sentinel: -100,
            method,
            max_iter: 300,
        }
    }

    /// The integer value in a `states` map that marks a variable as
    /// hidden rather than observed. Defaults to `-100`, matching common
    /// reference conventions for "no label here".
    pub fn with_hidden_sentinel(mut self, sentinel: i64) -> Self {
        self.hidden_sentinel = sentinel;
        self
    }

    pub fn with_regularization(mut self, regularization: Regularization) -> Self {
        self.learner = self.learner.with_regularization(regularization);
        self
    }

    pub fn with_tolerances(mut self, tol: f64, max_iter: usize) -> Self {
        self.learner = self.learner.with_tolerances(tol, max_iter);
        self.max_iter = max_iter;
        self
    }

    pub fn with_em_max_rounds(mut self, em_max_rounds: usize) -> Self {
        self.learner = self.learner.with_em_max_rounds(em_max_rounds);
        self
    }

    /// Adds one training example. `states` maps a declared variable to
    /// either its observed label or `hidden_sentinel`; the sentinel never
    /// crosses further into the numerical code than this call.
    pub fn add_example(&mut self, model: LogLinearModel, states: BTreeMap<usize, i64>) -> FieldResult<()> {
        let labels = states
            .into_iter()
            .map(|(v, s)| {
                let label = if s == self.hidden_sentinel { None } else { Some(s as usize) };
                (v, label)
            })
            .collect();
        self.learner.add_data(model, labels)?;
        Ok(())
    }

    pub fn num_examples(&self) -> usize {
        self.learner.num_examples()
    }

    /// The shared weight layout across every example added so far.
    pub fn weight_layout(&self) -> FieldResult<WeightLayout> {
        self.learner.weight_layout()
    }

    /// The per-call belief-propagation iteration budget this trainer's
    /// method actually uses: `inner_iterations` for paired-dual, the full
    /// `max_iter` for subgradient and EM's M-step.
    pub fn inner_iteration_budget(&self) -> usize {
        match self.method {
            LearningMethod::PairedDual { inner_iterations } => inner_iterations,
            LearningMethod::Subgradient | LearningMethod::Em => self.max_iter,
        }
    }

    /// Draws an initial weight vector from a standard normal distribution,
    /// sized to the shared `WeightLayout` of every example added so far.
    pub fn random_initial_weights(&self) -> FieldResult<Vec<f64>> {
        let layout = self.learner.weight_layout()?;
        Ok(gaussian_vec(layout.total_len()))
    }

    /// Trains with a caller-supplied minimizer and initial weights,
    /// recording every iterate into `log` when supplied.
    pub fn train_with(
        &mut self,
        minimizer: &dyn Minimizer,
        w0: Vec<f64>,
        log: Option<&mut IterateLog>,
    ) -> FieldResult<Vec<f64>> {
        self.learner.train(minimizer, w0, log)
    }

    /// Convenience entry point: random weight initialization and the
    /// default backtracking-line-search minimizer.
    pub fn train(&mut self, log: Option<&mut IterateLog>) -> FieldResult<Vec<f64>> {
        let w0 = self.random_initial_weights()?;
        let minimizer = BacktrackingGradientDescent::default();
        self.train_with(&minimizer, w0, log)
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
    fn sentinel_labels_translate_to_hidden_variables() {
        let mut trainer = Trainer::new(LearningMethod::Subgradient).with_hidden_sentinel(-100);
        let mut states = BTreeMap::new();
        states.insert(0, 0);
        states.insert(1, -100);
        trainer.add_example(toy_model(), states).unwrap();
        assert_eq!(trainer.num_examples(), 1);
    }

    #[test]
    fn train_produces_a_weight_vector_of_the_expected_length() {
        let mut trainer = Trainer::new(LearningMethod::Subgradient).with_tolerances(1e-6, 20);
        let mut states = BTreeMap::new();
        states.insert(0, 0);
        states.insert(1, 1);
        trainer.add_example(toy_model(), states).unwrap();

        let mut log = IterateLog::new();
        let w = trainer.train(Some(&mut log)).unwrap();
        assert_eq!(w.len(), trainer.weight_layout().unwrap().total_len());
        assert!(!log.is_empty());
    }
}
