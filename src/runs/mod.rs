pub mod error;
pub mod launcher;
pub mod process;
pub mod reconcile;
pub mod staging;
pub mod state;
pub mod store;

pub use error::RunError;
pub use launcher::{EngineCatalog, WorkflowType};
pub use process::ProcessRegistry;
pub use reconcile::{reconcile, Reconciled, EXIT_CODE_UNRECONCILED};
pub use staging::{stage_submission, Attachment, RunSubmission};
pub use state::RunState;
pub use store::{RunPaths, RunRequest, RunStore};
