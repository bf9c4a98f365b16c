pub mod audit;
pub mod memory;
pub mod snapshot;
pub mod traits;

pub use audit::*;
pub use memory::*;
pub use snapshot::*;
pub use traits::*;
