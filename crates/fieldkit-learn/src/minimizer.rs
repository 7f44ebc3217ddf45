use fieldkit_error::FieldResult;

/// Snapshot of every iterate a [`Minimizer`] produced, for diagnostics or
/// plotting. Mirrors the reference implementation's callback-driven
/// weight/time recorder: every accepted step is appended, nothing is
/// sampled or decimated.
#[derive(Clone, Debug, Default)]
pub struct IterateLog {
    pub weights: Vec<Vec<f64>>,
    pub objective: Vec<f64>,
}

impl IterateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, w: &[f64], f: f64) {
        self.weights.push(w.to_vec());
        self.objective.push(f);
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// A smooth-objective minimizer contract: given `w0`, an objective `f`,
/// and its gradient `grad_f`, return a stationary point. `callback`, when
/// supplied, receives every accepted iterate for recording.
///
/// L1 regularization is not smooth at the origin; implementations handle
/// it via a soft-thresholding step or a smoothed penalty rather than
/// requiring the caller to do so.
pub trait Minimizer {
    fn minimize(
        &self,
        w0: Vec<f64>,
        objective: &dyn Fn(&[f64]) -> FieldResult<f64>,
        gradient: &dyn Fn(&[f64]) -> FieldResult<Vec<f64>>,
        callback: Option<&mut dyn FnMut(&[f64], f64)>,
    ) -> FieldResult<Vec<f64>>;
}

/// A fixed-schedule backtracking gradient descent: at each step, try the
/// current step size, halving it until the objective decreases (or a
/// minimum step size is hit), then take that step. Grounded on the
/// reference implementation's own hand-rolled `sgd`/line-search loop; not
/// a substitute for a production L-BFGS binding, which a driver can swap
/// in via the `Minimizer` trait.
pub struct BacktrackingGradientDescent {
    pub max_iter: usize,
    pub initial_step: f64,
    pub min_step: f64,
    pub tol: f64,
}

impl Default for BacktrackingGradientDescent {
    fn default() -> Self {
        Self {
            max_iter: 500,
            initial_step: 1.0,
            min_step: 1e-10,
            tol: 1e-6,
        }
    }
}

impl Minimizer for BacktrackingGradientDescent {
    fn minimize(
        &self,
        w0: Vec<f64>,
        objective: &dyn Fn(&[f64]) -> FieldResult<f64>,
        gradient: &dyn Fn(&[f64]) -> FieldResult<Vec<f64>>,
        mut callback: Option<&mut dyn FnMut(&[f64], f64)>,
    ) -> FieldResult<Vec<f64>> {
        let mut w = w0;
        let mut f_current = objective(&w)?;
        if let Some(cb) = callback.as_deref_mut() {
            cb(&w, f_current);
        }

        for iter in 0..self.max_iter {
            let grad = gradient(&w)?;
            let grad_norm: f64 = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
            if grad_norm <= self.tol {
                tracing::debug!(iter, grad_norm, "gradient descent converged");
                break;
            }

            let mut step = self.initial_step;
            loop {
                let candidate: Vec<f64> = w
                    .iter()
                    .zip(grad.iter())
                    .map(|(wi, gi)| wi - step * gi)
                    .collect();
                let f_candidate = objective(&candidate)?;
                if f_candidate <= f_current || step < self.min_step {
                    w = candidate;
                    f_current = f_candidate;
                    break;
                }
                step *= 0.5;
            }

            if let Some(cb) = callback.as_deref_mut() {
                cb(&w, f_current);
            }
            tracing::trace!(iter, objective = f_current, step, "gradient descent step");
        }

        Ok(w)
    }
}
