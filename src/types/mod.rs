//! Core value types shared across the detection pipeline.

pub mod alert;
pub mod frame;

pub use alert::{Alert, AlertType, Severity};
pub use frame::{payload_entropy, CanFrame, MAX_EXTENDED_ID, MAX_STANDARD_ID};
