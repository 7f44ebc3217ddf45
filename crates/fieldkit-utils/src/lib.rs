pub mod arena;
pub mod array;
pub mod random;

pub use arena::{Arena, ArenaKey};
pub use array::{Shape, Strides, Tensor, TensorError};
