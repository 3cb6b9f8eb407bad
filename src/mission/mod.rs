//! Mission runtime: the controller state machine, per-step executor, human
//! gating, and the bounded task set that ties them to job triggers.

pub mod context;
pub mod control;
pub mod controller;
pub mod executor;
pub mod runtime;

pub use control::{apply_control, sync_job_for_mission, ControlError};
pub use controller::MissionController;
pub use runtime::{MissionRuntime, DEFAULT_MAX_CONCURRENT_MISSIONS};
