use std::cell::RefCell;
use std::collections::BTreeMap;

use fieldkit_error::{FieldResult, field_err};
use fieldkit_model::{LogLinearModel, WeightLayout};
use fieldkit_utils::{Arena, ArenaKey};

use crate::minimizer::{IterateLog, Minimizer};
use crate::regularization::Regularization;
use crate::training_example::TrainingExample;

/// Which parameter-estimation variant `Learner::train` runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LearningMethod {
    /// Full subgradient max-likelihood: each objective/gradient call runs
    /// inference to convergence on every example.
    Subgradient,
    /// Paired-dual: inner BP runs for a small fixed budget per outer
    /// step, trading inner fidelity for outer progress.
    PairedDual { inner_iterations: usize },
    /// Expectation-maximization over partially labeled examples:
    /// alternates a conditioned E-step with a fully-observed M-step.
    Em,
}

/// Owns every training example (model + partial labels + empirical
/// expectation) and drives one of three parameter-estimation variants
/// over a shared flat weight vector. Examples are wrapped in `RefCell` so
/// the objective/gradient closures handed to a [`Minimizer`] — which take
/// `&dyn Fn`, not `&dyn FnMut` — can still cache inference results behind
/// a shared reference.
pub struct Learner {
    examples: Arena<RefCell<TrainingExample>>,
    layout: Option<WeightLayout>,
    regularization: Regularization,
    tol: f64,
    max_iter: usize,
    em_max_rounds: usize,
    method: LearningMethod,
}

impl Learner {
    pub fn new(method: LearningMethod) -> Self {
        Self {
            examples: Arena::new(),
            layout: None,
            regularization: Regularization::none(),
            tol: 1e-5,
            max_iter: 300,
            em_max_rounds: 20,
            method,
        }
    }

    pub fn with_regularization(mut self, regularization: Regularization) -> Self {
        self.regularization = regularization;
        self
    }

    pub fn with_tolerances(mut self, tol: f64, max_iter: usize) -> Self {
        self.tol = tol;
        self.max_iter = max_iter;
        self
    }

    pub fn with_em_max_rounds(mut self, em_max_rounds: usize) -> Self {
        self.em_max_rounds = em_max_rounds;
        self
    }

    pub fn num_examples(&self) -> usize {
        self.examples.len()
    }

    pub fn weight_layout(&self) -> FieldResult<WeightLayout> {
        self.layout
            .ok_or_else(|| field_err!(InvalidConfig: "no training examples have been added yet"))
    }

    /// Adds one training example. `labels` maps every variable the caller
    /// has an opinion about to `Some(state)`; a variable present with
    /// `None`, or absent entirely, is treated as hidden. Every example
    /// added to one `Learner` must share the same weight layout (`d_u`,
    /// `d_e`, and `K`), validated here.
    pub fn add_data(
        &mut self,
        model: LogLinearModel,
        labels: BTreeMap<usize, Option<usize>>,
    ) -> FieldResult<ArenaKey> {
        let layout = model.weight_layout()?;
        match self.layout {
            Some(existing) => fieldkit_error::ensure!(
                existing == layout,
                InvalidConfig: "example has weight layout {:?}, learner expects {:?}", layout, existing
            ),
            None => self.layout = Some(layout),
        }

        let example = TrainingExample::new(model, labels, layout, self.tol, self.max_iter)?;
        Ok(self.examples.insert(RefCell::new(example)))
    }

    fn inner_max_iter(&self) -> usize {
        match self.method {
            LearningMethod::PairedDual { inner_iterations } => inner_iterations,
            _ => self.max_iter,
        }
    }

    /// `f(w) = λ₁‖w‖₁ + ½λ₂wᵀw − wᵀ·mean(ŝ) + mean(A_i(w))`.
    pub fn objective(&self, w: &[f64]) -> FieldResult<f64> {
        let layout = self.weight_layout()?;
        fieldkit_error::ensure!(!self.examples.is_empty(), InvalidConfig: "learner has no training examples");

        let n = self.examples.len() as f64;
        let mut mean_a = 0.0;
        let mut mean_s_hat = vec![0.0; layout.total_len()];

        for example in self.examples.iter() {
            let mut example = example.borrow_mut();
            let a = match self.method {
                LearningMethod::PairedDual { .. } => {
                    let (_, a) = example.model_expectation_dual(w, layout, self.tol, self.inner_max_iter())?;
                    a
                }
                _ => {
                    let (_, a) = example.model_expectation(w, layout, self.tol, self.inner_max_iter())?;
                    a
                }
            };
            mean_a += a / n;
            for (acc, &s) in mean_s_hat.iter_mut().zip(example.s_hat.iter()) {
                *acc += s / n;
            }
        }

        let w_dot_s_hat: f64 = w.iter().zip(mean_s_hat.iter()).map(|(a, b)| a * b).sum();
        Ok(self.regularization.penalty(w) - w_dot_s_hat + mean_a)
    }

    /// `∇f(w) = λ₁sign(w) + λ₂w + mean(μ_i(w) − ŝ_i)`.
    pub fn gradient(&self, w: &[f64]) -> FieldResult<Vec<f64>> {
        let layout = self.weight_layout()?;
        fieldkit_error::ensure!(!self.examples.is_empty(), InvalidConfig: "learner has no training examples");

        let n = self.examples.len() as f64;
        let mut grad = self.regularization.subgradient(w);

        for example in self.examples.iter() {
            let mut example = example.borrow_mut();
            let mu = match self.method {
                LearningMethod::PairedDual { .. } => {
                    let (mu, _) = example.model_expectation_dual(w, layout, self.tol, self.inner_max_iter())?;
                    mu
                }
                _ => {
                    let (mu, _) = example.model_expectation(w, layout, self.tol, self.inner_max_iter())?;
                    mu
                }
            };
            for ((g, &m), &s) in grad.iter_mut().zip(mu.iter()).zip(example.s_hat.iter()) {
                *g += (m - s) / n;
            }
        }

        Ok(grad)
    }

    /// Runs `minimizer` against the current method's objective/gradient.
    /// For `Em`, alternates an E-step (refreshing every example's `ŝ`
    /// under the current weights) with an M-step (minimizing the
    /// fully-observed objective) until the weights stop changing.
    pub fn train(
        &mut self,
        minimizer: &dyn Minimizer,
        w0: Vec<f64>,
        mut log: Option<&mut IterateLog>,
    ) -> FieldResult<Vec<f64>> {
        let layout = self.weight_layout()?;
        fieldkit_error::ensure!(
            w0.len() == layout.total_len(),
            InvalidConfig: "initial weight vector has length {}, expected {}", w0.len(), layout.total_len()
        );

        match self.method {
            LearningMethod::Subgradient | LearningMethod::PairedDual { .. } => {
                let objective = |w: &[f64]| self.objective(w);
                let gradient = |w: &[f64]| self.gradient(w);
                let mut callback = log.as_deref_mut().map(|log| {
                    let cb: Box<dyn FnMut(&[f64], f64)> = Box::new(move |w: &[f64], f: f64| log.record(w, f));
                    cb
                });
                minimizer.minimize(w0, &objective, &gradient, callback.as_deref_mut())
            }
            LearningMethod::Em => {
                let mut w = w0;
                for round in 0..self.em_max_rounds {
                    for example in self.examples.iter() {
                        example
                            .borrow_mut()
                            .refresh_empirical_expectation(&w, layout, self.tol, self.max_iter)?;
                    }

                    let objective = |w: &[f64]| self.objective(w);
                    let gradient = |w: &[f64]| self.gradient(w);
                    let w_new = minimizer.minimize(w.clone(), &objective, &gradient, None)?;

                    let delta: f64 = w_new
                        .iter()
                        .zip(w.iter())
                        .map(|(a, b)| (a - b).abs())
                        .sum();

                    if let Some(log) = log.as_deref_mut() {
                        let f = self.objective(&w_new)?;
                        log.record(&w_new, f);
                    }

                    tracing::debug!(round, delta, "EM round complete");
                    w = w_new;
                    if delta <= self.tol {
                        break;
                    }
                }
                Ok(w)
            }
        }
    }
}
