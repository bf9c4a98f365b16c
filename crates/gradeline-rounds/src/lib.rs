pub mod controller;
pub mod policy;

pub use controller::*;
pub use policy::*;
