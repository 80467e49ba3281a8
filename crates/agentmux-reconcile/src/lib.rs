//! Session reconciliation: the tab model, the periodic sync protocol that
//! aligns it with the session backend's ground truth, and the debounced
//! persistence path.

pub mod cycle;
pub mod model;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use cycle::{Reconciler, ReconcilerConfig};
pub use model::TabModel;
pub use sync::{run_sync_pass, KnownSession, SyncSnapshot};
