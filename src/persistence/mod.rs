//! Persistence Layer
//!
//! Snapshot of tracked positions for restart reconciliation.

pub mod state_store;

pub use state_store::{PersistedState, StateStore};
