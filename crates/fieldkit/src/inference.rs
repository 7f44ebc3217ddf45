use fieldkit_error::FieldResult;
use fieldkit_infer::{BeliefPropagator, CountingNumbers, DisplayMode, InferenceReport};
use fieldkit_model::LogLinearModel;

/// Which counting-number scheme to run inference under — the `bethe`,
/// `trbp(ρ)`, `convex(c_uv, c_v)` configurations enumerated for both
/// training-time learners and stand-alone inference callers.
#[derive(Clone, Debug, PartialEq)]
pub enum CountingScheme {
    Bethe,
    Trbp { edge_appearance: Vec<f64> },
    Convex { c_edges: Vec<f64>, c_vars: Vec<f64> },
}

impl CountingScheme {
    fn build(&self, topology: &fieldkit_model::Topology) -> FieldResult<CountingNumbers> {
        match self {
            CountingScheme::Bethe => CountingNumbers::bethe(topology),
            CountingScheme::Trbp { edge_appearance } => CountingNumbers::trbp(topology, edge_appearance),
            CountingScheme::Convex { c_edges, c_vars } => {
                CountingNumbers::convex(topology, c_edges.clone(), c_vars.clone())
            }
        }
    }
}

/// Builds a [`BeliefPropagator`] over `model`'s current matrices under the
/// chosen counting-number scheme and runs it to convergence (or
/// `max_iter`). `model.create_matrices()` must already have been called —
/// a caller building a model from scratch typically does this via
/// `set_weights` or an explicit `create_matrices()` call before reaching
/// for this helper.
pub fn run_inference(
    model: &LogLinearModel,
    scheme: &CountingScheme,
    tol: f64,
    max_iter: usize,
    display: DisplayMode,
) -> FieldResult<(BeliefPropagator, InferenceReport)> {
    let topology = model.topology()?;
    let counting = scheme.build(&topology)?;
    let mut bp = BeliefPropagator::new(topology, counting);
    let mv = model.matrices()?;
    let report = bp.infer(&mv.unary, &mv.edge_pot, tol, max_iter, display)?;
    Ok((bp, report))
}
