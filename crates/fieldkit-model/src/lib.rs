//! Graph structure and log-linear parameterization for pairwise discrete
//! Markov random fields: declaring variables and edges, storing unary and
//! edge log-potentials (either directly or via a shared feature/weight
//! decomposition), and materializing the dense `U`/`Φ` matrices the
//! inference engine consumes.

mod log_linear_model;
mod markov_net;

pub use log_linear_model::{LogLinearModel, WeightLayout};
pub use markov_net::{HalfEdge, MarkovNet, MatrixView, Topology};
