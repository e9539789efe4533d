//! In-memory state of the simulated sonicator controller.
//!
//! The [`DeviceModel`] is the single source of truth for both protocol front
//! ends. It is created once by the session bootstrap and handed to each front
//! end at construction.

pub mod channel;
pub mod model;

pub use channel::{
    Channel, ChannelField, FieldValue, AMPLITUDE_ADC_FULL_SCALE, AMPLITUDE_MAX, AMPLITUDE_MIN,
    CHANNEL_COUNT,
};
pub use model::{derive, unit_index, DeviceModel, DeviceState, Registers};
