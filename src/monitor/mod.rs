//! The periodic monitoring pipeline: cycle, state machine, side effects and
//! the snapshot readers see.

mod controller;
pub mod cycle;
mod effects;
pub mod snapshot;
pub mod state_machine;
mod telemetry;
mod worker;

pub use controller::{MonitorController, MonitorServices};
pub use cycle::{run_cycle, BlockingSlot, CycleFailure, CycleOutcome, CycleTimings};
pub use effects::{EffectContext, EffectRunner, Notifier, SoundPlayer};
pub use snapshot::{status_reporter, MonitorSnapshot};
pub use state_machine::{format_wait, Effect, StateMachine, StateMachineConfig, StateTransition, Step};
pub use telemetry::Telemetry;
pub use worker::{monitor_loop, MonitorFlags, MonitorWorker};
