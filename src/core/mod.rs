/// Pure reconciliation state and the advance/rebase algorithm.
pub mod state;
