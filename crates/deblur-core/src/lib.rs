pub mod engine;
pub mod ids;
pub mod model;
pub mod report;
pub mod time;
pub mod types;

pub use engine::*;
pub use ids::*;
pub use model::*;
pub use report::*;
pub use time::*;
pub use types::*;
