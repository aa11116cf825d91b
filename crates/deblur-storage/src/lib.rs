pub mod cached;
pub mod error;
pub mod keys;
pub mod memory;
pub mod rules;
pub mod traits;

pub use cached::CachedTaskStore;
pub use error::{StorageError, StorageResult};
pub use keys::{derive_keys, DerivedKeys};
pub use memory::InMemoryTaskStore;
pub use traits::{CreateOutcome, ItemUpdate, NewTask, StatusUpdate, TaskStore};
