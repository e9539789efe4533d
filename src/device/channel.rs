use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Number of sonicator channels on the simulated controller.
pub const CHANNEL_COUNT: usize = 4;

pub const AMPLITUDE_MIN: u8 = 20;
pub const AMPLITUDE_MAX: u8 = 100;

/// Full scale of the harness' 10-bit amplitude ADC.
pub const AMPLITUDE_ADC_FULL_SCALE: u16 = 1023;

/// State of one sonicator channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub running: bool,
    pub overload: bool,
    pub freq_lock: bool,
    pub frequency_hz: u16,
    pub power_w: f32,
    pub amplitude_setpoint: u8,
    pub reset_pulse_pending: bool,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            running: false,
            overload: false,
            freq_lock: false,
            frequency_hz: 20_000,
            power_w: 0.0,
            amplitude_setpoint: 50,
            reset_pulse_pending: false,
        }
    }
}

impl Channel {
    /// Status register layout: bit0 running, bit1 overload, bit2 frequency lock.
    pub fn status_bits(&self) -> u16 {
        let mut bits = 0u16;
        if self.running {
            bits |= 1 << 0;
        }
        if self.overload {
            bits |= 1 << 1;
        }
        if self.freq_lock {
            bits |= 1 << 2;
        }
        bits
    }

    /// Amplitude setpoint as seen by the harness ADC.
    pub fn amplitude_adc(&self) -> u16 {
        let scaled = self.amplitude_setpoint as u32 * AMPLITUDE_ADC_FULL_SCALE as u32;
        ((scaled + 50) / 100) as u16
    }
}

/// Addressable channel fields, as named on the ASCII protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ChannelField {
    #[strum(to_string = "START", serialize = "RUNNING")]
    Running,
    Overload,
    FreqLock,
    Frequency,
    Power,
    Amplitude,
    #[strum(to_string = "RESET")]
    ResetPulse,
}

/// A field value read from the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Word(u16),
    Byte(u8),
    Float(f32),
}

impl FieldValue {
    /// Numeric rendering used on the wire: flags are `0`/`1`.
    pub fn to_wire(&self) -> String {
        match self {
            FieldValue::Flag(v) => u8::from(*v).to_string(),
            FieldValue::Word(v) => v.to_string(),
            FieldValue::Byte(v) => v.to_string(),
            FieldValue::Float(v) => format!("{v:.1}"),
        }
    }
}

impl Channel {
    pub fn field(&self, field: ChannelField) -> FieldValue {
        match field {
            ChannelField::Running => FieldValue::Flag(self.running),
            ChannelField::Overload => FieldValue::Flag(self.overload),
            ChannelField::FreqLock => FieldValue::Flag(self.freq_lock),
            ChannelField::Frequency => FieldValue::Word(self.frequency_hz),
            ChannelField::Power => FieldValue::Float(self.power_w),
            ChannelField::Amplitude => FieldValue::Byte(self.amplitude_setpoint),
            ChannelField::ResetPulse => FieldValue::Flag(self.reset_pulse_pending),
        }
    }
}
