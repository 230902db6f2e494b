//! Common structs used throughout the library.

mod id;
mod node;

pub use id::*;
pub use node::*;
