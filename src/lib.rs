//! sonicsim: simulated 4-channel sonicator controller for hardware-in-the-loop tests
//!
//! One in-memory [`DeviceModel`] is exposed over two independent serial
//! protocols: a Modbus RTU slave (the controller's fieldbus interface) and a
//! line-based ASCII protocol (the test-harness microcontroller wired to its
//! pins). Null-modem pairs let test code reach both without cabling.
//!
//! Start everything with [`Simulator::start`], or use the front ends directly
//! with any [`protocol::transport::Transport`].

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod protocol;
pub mod utils;

pub use api::*;
pub use config::SimConfig;
pub use device::{Channel, ChannelField, DeviceModel, DeviceState, FieldValue};
pub use error::{Result, SimError};
