//! # Delivery Simulator
//!
//! Drives a fleet of delivery drones against the delivery store.
//!
//! ## Features
//!
//! - Drone state cycle with contended job claims
//! - Hold and release of delivered jobs
//! - Paced textual frames from snapshot streams
//! - Store self-check

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod check;
pub mod fleet;
pub mod frame;

pub use check::self_check;
pub use fleet::{Fleet, FleetConfig, TickReport};
pub use frame::{Frame, FrameReporter};
