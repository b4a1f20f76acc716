//! Supervisor Layer
//!
//! Operator-facing alerts for conditions that need a human.

pub mod alert_manager;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
