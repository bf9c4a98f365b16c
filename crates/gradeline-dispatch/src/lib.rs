pub mod dispatcher;
pub mod policy;
pub mod scheduler;
pub mod transport;

pub use dispatcher::*;
pub use policy::*;
pub use transport::*;
