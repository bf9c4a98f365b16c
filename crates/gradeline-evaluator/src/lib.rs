pub mod browser;
pub mod checks;
pub mod evaluator;
pub mod inspect;
pub mod judge;
pub mod pool;

pub use browser::*;
pub use checks::*;
pub use evaluator::*;
pub use inspect::*;
pub use judge::*;
pub use pool::*;

#[cfg(test)]
mod testing;
