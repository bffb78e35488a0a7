//! Leader-only reconciliation workers.

mod queue;
mod runner;

pub use queue::WorkQueue;
pub use runner::ControllerHandle;
pub use runner::ControllerRunner;
pub use runner::ReconcileError;
pub use runner::Reconciler;
