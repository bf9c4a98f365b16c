pub mod config;
pub mod handlers;
pub mod pipeline;
pub mod serve;
pub mod state;

pub use config::GradelineConfig;
pub use handlers::router;
pub use pipeline::{Capabilities, Pipeline};
pub use serve::serve;
pub use state::AppState;
