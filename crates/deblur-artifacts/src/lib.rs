mod naming;
mod store;

pub use naming::output_path_for;
pub use store::{CommitError, CommittedArtifact, FsResultCommitter, ResultCommitter};
