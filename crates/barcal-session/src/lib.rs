//! `barcal-session`
//!
//! Calibration workflow on top of the bar bus driver.
//!
//! ## Key Types
//!
//! - [`DeviceSession`]: single owner of the bus; starts, supersedes and stops operations
//! - [`CalibrationPlan`]: ordered zero and weight-placement steps
//! - [`Sampler`]: live → warm-up → averaging state machine for one step
//! - [`SessionEvent`]: progress stream consumed by front ends
//!
//! Flashing lives in [`flash`], the live weight loop in [`test_mode`].

pub mod error;
pub mod events;
pub mod flash;
pub mod operation;
pub mod plan;
pub mod sampler;
pub mod session;
pub mod test_mode;

pub use error::{SessionError, SessionResult};
pub use events::{EventSink, SessionEvent, EVENT_CAPACITY};
pub use flash::{flash_parameters, FlashPolicy, FlashProgress, FlashStage};
pub use operation::{CancelHandle, OperationContext, OperationKind};
pub use plan::{build_plan, CalibrationPlan, CalibrationStep, Face, Placement, Side, StepKind};
pub use sampler::{
    collect_averaged_zeros, go_trigger, ChannelSource, GoHandle, GoTrigger, SampleSnapshot, Sampler,
    SamplingPhase, SamplingTargets, ZeroPhase, ZerosProgress,
};
pub use session::{
    CalibrationMatrices, ComputeReport, ConnectReport, DeviceSession, FactorEntry, SessionSettings,
};
pub use test_mode::{BarFactors, BarSnapshot, BarZeros, ChannelWeight, TestConfig, TestSnapshot};
