//! ClusterDeployment lifecycle controller
//!
//! Reconciliation is keyed by [`ClusterKey`](crate::naming::ClusterKey) and
//! reads the live object on every pass, so one function serves both the
//! create path (object present) and the delete path (object gone).

mod cluster;

pub use cluster::{reconcile, Context, ContextBuilder, ReconcileOutcome};
