mod migrations;
mod storage;

pub use migrations::{apply_migrations, MIGRATIONS};
pub use storage::SqliteTaskStore;
