//! Variational inference and parameter learning for pairwise log-linear
//! Markov random fields: counting-number-parameterized belief propagation
//! (Bethe / TRBP / convex) plus subgradient, paired-dual, and EM parameter
//! learners, composed here into a plain library driver with no CLI or
//! file-I/O surface of its own.

mod inference;
mod trainer;

pub use fieldkit_error::{FieldError, FieldResult};
pub use fieldkit_infer::{BeliefPropagator, CountingNumbers, DisplayMode, InferenceReport};
pub use fieldkit_learn::{
    feature_expectation, BacktrackingGradientDescent, IterateLog, Learner, LearningMethod, Minimizer, Regularization,
    TrainingExample,
};
pub use fieldkit_model::{HalfEdge, LogLinearModel, MarkovNet, MatrixView, Topology, WeightLayout};

pub use inference::{run_inference, CountingScheme};
pub use trainer::Trainer;
