//! Kiosk Logic - Orchestration State Machines
//!
//! Multi-step measurement protocols built on the signal transport: the
//! polling session shared by all of them, the DRC secondary, and the
//! multi-robot instance and coordinator.

mod drc;
mod host;
mod multirobot;
mod session;
mod wait;

pub use drc::{transition as drc_transition, DrcAction, DrcSecondary, DrcState, DrcStats};
pub use host::{HostError, MeasurementHost, SimulatedHost};
pub use multirobot::{
    robot_transition, CycleError, CyclePlan, CycleSummary, MultiRobotCoordinator,
    MultiRobotMeasure, RobotAction, RobotState, StepReply,
};
pub use session::{Collected, Session, SignalLink, Transition};
pub use wait::{wait_until, Step, WaitCheck, WaitError, WaitPolicy};
