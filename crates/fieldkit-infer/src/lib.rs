//! Counting-number-parameterized variational message passing over pairwise
//! discrete Markov random fields: Bethe belief propagation, tree-reweighted
//! BP, and general convex BP behind a single [`BeliefPropagator`].

mod counting;
mod math;
mod propagator;

pub use counting::CountingNumbers;
pub use fieldkit_model::HalfEdge;
pub use math::{logsumexp, nan_to_num, normalize_log};
pub use propagator::{BeliefPropagator, BpState, DisplayMode, InferenceReport};
