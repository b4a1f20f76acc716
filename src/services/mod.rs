pub mod inbox;
pub mod scheduler;

pub use inbox::{JsonInboxSource, StructureSource};
pub use scheduler::{OpenTickReport, Scheduler, SchedulerStats};
