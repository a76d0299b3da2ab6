//! Scheduling: periodic routines, stall recovery, and the control plane
//! that runs them alongside the queue API.

pub mod control;
pub mod periodic;
pub mod reclaimer;

pub use control::{ControlConfig, ControlPlane};
pub use periodic::{Handler, PeriodicRoutine};
pub use reclaimer::StallReclaimer;
