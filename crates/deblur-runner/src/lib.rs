pub mod app;
pub mod batch;
pub mod config;
pub mod editor;
pub mod guard;
pub mod heartbeat;
pub mod http_editor;
pub mod recovery;

pub use app::*;
pub use batch::*;
pub use config::*;
pub use editor::*;
pub use guard::*;
pub use heartbeat::*;
pub use http_editor::*;
pub use recovery::*;
