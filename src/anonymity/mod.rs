//! Anonymity-network support
//!
//! This module provides:
//! - Launching and terminating the external anonymity process
//! - The authenticated control channel used for identity rotation
//! - The controller state machine tying both to a session's scope

pub mod control;
pub mod controller;
pub mod process;

pub use control::{ControlChannel, TorControlChannel};
pub use controller::{AnonymityController, AnonymityState};
pub use process::AnonymityProcess;
