//! Budget and frequency-cap enforcement.
//!
//! `guard` is the hard, selection-time filter. `reconciler` only prunes state
//! in the background and is allowed to lag behind it.

pub mod guard;
pub mod reconciler;

pub use guard::{BudgetGuard, Exclusion};
pub use reconciler::{BudgetReconciler, ReconcileReport, ReconcilerHandle};
