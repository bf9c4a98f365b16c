pub mod check;
pub mod cohort;
pub mod error;
pub mod result;
pub mod submission;
pub mod task;
pub mod template;

pub use check::*;
pub use cohort::*;
pub use error::*;
pub use result::*;
pub use submission::*;
pub use task::*;
pub use template::*;
