//! cansentry — baseline-learning intrusion detection for CAN buses.
//!
//! The pipeline ingests a stream of CAN frames, learns per-ID
//! statistical profiles during a learning window, then runs four
//! detectors (drop, tamper, replay, general rules) against the frozen
//! baseline and routes alerts through a throttling alert manager to
//! console and rolling log sinks.

pub mod alerting;
pub mod baseline;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod source;
pub mod state;
pub mod types;

pub use config::Config;
pub use engine::{MaintenanceCmd, Pipeline, RunPhase};
pub use error::{IdsError, Result};
pub use types::{Alert, AlertType, CanFrame, Severity};
