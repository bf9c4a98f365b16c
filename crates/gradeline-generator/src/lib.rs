pub mod builtin;
pub mod generator;
pub mod payload;
pub mod registry;
pub mod seed;

pub use generator::*;
pub use payload::*;
pub use registry::*;
pub use seed::*;
