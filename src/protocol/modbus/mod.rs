//! Modbus RTU front end: register map, framing, slave and master.

pub mod client;
pub mod frame;
pub mod register_map;
pub mod server;

pub use client::ModbusClient;
pub use frame::crc16_modbus;
pub use register_map::{RegisterBehavior, RegisterLayout, RegisterMap};
pub use server::FrameServer;

/// Unit id the simulated controller answers to by default.
pub const DEFAULT_UNIT_ID: u8 = 2;
/// Default line speed (8N1).
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
