mod features;
mod learner;
mod minimizer;
mod regularization;
mod training_example;

pub use features::feature_expectation;
pub use learner::{Learner, LearningMethod};
pub use minimizer::{BacktrackingGradientDescent, IterateLog, Minimizer};
pub use regularization::Regularization;
pub use training_example::TrainingExample;
