use parking_lot::RwLock;
use rmodbus::server::storage::ModbusStorageSmall;
use serde::Serialize;
use std::sync::Arc;

use super::channel::{
    Channel, ChannelField, FieldValue, AMPLITUDE_MAX, AMPLITUDE_MIN, CHANNEL_COUNT,
};
use crate::error::{Result, SimError};

/// Plain holding-register storage backing addresses without side effects.
pub type Registers = ModbusStorageSmall;

/// Snapshot of the whole controller, including derived aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub channels: [Channel; CHANNEL_COUNT],
    pub active_count: u8,
    pub active_mask: u8,
}

impl Default for DeviceState {
    fn default() -> Self {
        let channels = [Channel::default(); CHANNEL_COUNT];
        let (active_count, active_mask) = derive(&channels);
        Self {
            channels,
            active_count,
            active_mask,
        }
    }
}

impl DeviceState {
    pub fn channel(&self, unit: u8) -> Result<&Channel> {
        Ok(&self.channels[unit_index(unit)?])
    }

    pub fn channel_mut(&mut self, unit: u8) -> Result<&mut Channel> {
        Ok(&mut self.channels[unit_index(unit)?])
    }

    fn refresh(&mut self) {
        let (count, mask) = derive(&self.channels);
        self.active_count = count;
        self.active_mask = mask;
    }
}

/// Compute `(active_count, active_mask)` from channel states.
///
/// Bit `u - 1` of the mask is set iff channel `u` is running.
pub fn derive(channels: &[Channel; CHANNEL_COUNT]) -> (u8, u8) {
    let mask = channels
        .iter()
        .enumerate()
        .filter(|(_, ch)| ch.running)
        .fold(0u8, |mask, (idx, _)| mask | (1 << idx));
    (mask.count_ones() as u8, mask)
}

/// Map a 1-based unit number to a channel index.
pub fn unit_index(unit: u8) -> Result<usize> {
    if unit == 0 || unit as usize > CHANNEL_COUNT {
        return Err(SimError::UnitOutOfRange {
            unit,
            max: CHANNEL_COUNT as u8,
        });
    }
    Ok(unit as usize - 1)
}

struct ModelInner {
    state: DeviceState,
    registers: Registers,
}

/// Thread-safe device model shared by the Modbus and ASCII front ends.
///
/// Cloning is cheap; every clone refers to the same state. All mutations take
/// the write lock and recompute derived fields before releasing it, so readers
/// never see a channel change without the matching aggregate update.
#[derive(Clone)]
pub struct DeviceModel {
    inner: Arc<RwLock<ModelInner>>,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceModel")
            .field("state", &self.snapshot())
            .finish()
    }
}

impl DeviceModel {
    pub fn new() -> Self {
        Self::with_channels([Channel::default(); CHANNEL_COUNT])
    }

    /// Build a model whose channels start from the given state.
    pub fn with_channels(channels: [Channel; CHANNEL_COUNT]) -> Self {
        let mut state = DeviceState {
            channels,
            active_count: 0,
            active_mask: 0,
        };
        state.refresh();
        Self {
            inner: Arc::new(RwLock::new(ModelInner {
                state,
                registers: Registers::new(),
            })),
        }
    }

    /// Run `f` under the read lock.
    pub fn read<T>(&self, f: impl FnOnce(&DeviceState, &Registers) -> T) -> T {
        let guard = self.inner.read();
        f(&guard.state, &guard.registers)
    }

    /// Run `f` under the write lock, then recompute derived fields before the
    /// lock is released.
    pub fn write<T>(&self, f: impl FnOnce(&mut DeviceState, &mut Registers) -> T) -> T {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let out = f(&mut inner.state, &mut inner.registers);
        inner.state.refresh();
        out
    }

    fn update(&self, unit: u8, f: impl FnOnce(&mut Channel)) -> Result<()> {
        let idx = unit_index(unit)?;
        self.write(|state, _| f(&mut state.channels[idx]));
        Ok(())
    }

    pub fn set_running(&self, unit: u8, value: bool) -> Result<()> {
        self.update(unit, |ch| ch.running = value)
    }

    pub fn set_overload(&self, unit: u8, value: bool) -> Result<()> {
        self.update(unit, |ch| ch.overload = value)
    }

    pub fn set_freq_lock(&self, unit: u8, value: bool) -> Result<()> {
        self.update(unit, |ch| ch.freq_lock = value)
    }

    pub fn set_frequency(&self, unit: u8, hz: u16) -> Result<()> {
        self.update(unit, |ch| ch.frequency_hz = hz)
    }

    pub fn set_power(&self, unit: u8, watts: f32) -> Result<()> {
        if !watts.is_finite() || watts < 0.0 {
            return Err(SimError::ValueOutOfRange {
                field: "power_w",
                value: watts as i64,
                min: 0,
                max: i64::MAX,
            });
        }
        self.update(unit, |ch| ch.power_w = watts)
    }

    pub fn set_amplitude(&self, unit: u8, percent: u8) -> Result<()> {
        if !(AMPLITUDE_MIN..=AMPLITUDE_MAX).contains(&percent) {
            return Err(SimError::ValueOutOfRange {
                field: "amplitude_setpoint",
                value: percent as i64,
                min: AMPLITUDE_MIN as i64,
                max: AMPLITUDE_MAX as i64,
            });
        }
        self.update(unit, |ch| ch.amplitude_setpoint = percent)
    }

    /// Arm a reset pulse on the channel's reset output.
    pub fn pulse_reset(&self, unit: u8) -> Result<()> {
        self.update(unit, |ch| ch.reset_pulse_pending = true)
    }

    /// Report whether a reset pulse was pending and clear it.
    pub fn take_reset_pulse(&self, unit: u8) -> Result<bool> {
        let idx = unit_index(unit)?;
        Ok(self.write(|state, _| {
            std::mem::replace(&mut state.channels[idx].reset_pulse_pending, false)
        }))
    }

    pub fn get(&self, unit: u8, field: ChannelField) -> Result<FieldValue> {
        let idx = unit_index(unit)?;
        Ok(self.read(|state, _| state.channels[idx].field(field)))
    }

    pub fn channel(&self, unit: u8) -> Result<Channel> {
        let idx = unit_index(unit)?;
        Ok(self.read(|state, _| state.channels[idx]))
    }

    pub fn snapshot(&self) -> DeviceState {
        self.read(|state, _| state.clone())
    }

    pub fn active_count(&self) -> u8 {
        self.read(|state, _| state.active_count)
    }

    pub fn active_mask(&self) -> u8 {
        self.read(|state, _| state.active_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn assert_consistent(state: &DeviceState) {
        let running = state.channels.iter().filter(|ch| ch.running).count() as u8;
        assert_eq!(state.active_count, running);
        assert_eq!(state.active_count, state.active_mask.count_ones() as u8);
        for (idx, ch) in state.channels.iter().enumerate() {
            assert_eq!(state.active_mask & (1 << idx) != 0, ch.running);
        }
    }

    #[test]
    fn derive_counts_running_channels() {
        let mut channels = [Channel::default(); CHANNEL_COUNT];
        assert_eq!(derive(&channels), (0, 0));
        channels[0].running = true;
        channels[3].running = true;
        assert_eq!(derive(&channels), (2, 0b1001));
    }

    #[test]
    fn set_running_rejects_bad_units() {
        let model = DeviceModel::new();
        assert!(matches!(
            model.set_running(0, true),
            Err(SimError::UnitOutOfRange { unit: 0, .. })
        ));
        assert!(matches!(
            model.set_running(5, true),
            Err(SimError::UnitOutOfRange { unit: 5, .. })
        ));
        assert_eq!(model.active_count(), 0);
    }

    #[test]
    fn derived_fields_hold_after_every_mutation() {
        let model = DeviceModel::new();
        let sequence = [
            (1, true),
            (2, true),
            (2, false),
            (4, true),
            (3, true),
            (1, false),
            (3, false),
        ];
        for (unit, value) in sequence {
            model.set_running(unit, value).unwrap();
            assert_consistent(&model.snapshot());
        }
        assert_eq!(model.active_mask(), 0b1000);
    }

    #[test]
    fn set_running_is_idempotent() {
        let once = DeviceModel::new();
        once.set_running(3, true).unwrap();

        let twice = DeviceModel::new();
        twice.set_running(3, true).unwrap();
        twice.set_running(3, true).unwrap();

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.active_count(), 1);
        assert_eq!(twice.active_mask(), 0b0100);
    }

    #[test]
    fn amplitude_range_is_enforced() {
        let model = DeviceModel::new();
        assert!(model.set_amplitude(1, 19).is_err());
        assert!(model.set_amplitude(1, 101).is_err());
        model.set_amplitude(1, 20).unwrap();
        model.set_amplitude(2, 100).unwrap();
        assert_eq!(model.channel(1).unwrap().amplitude_setpoint, 20);
        assert_eq!(model.get(2, ChannelField::Amplitude).unwrap(), FieldValue::Byte(100));
    }

    #[test]
    fn reset_pulse_is_consumed_once() {
        let model = DeviceModel::new();
        assert!(!model.take_reset_pulse(2).unwrap());
        model.pulse_reset(2).unwrap();
        assert!(model.take_reset_pulse(2).unwrap());
        assert!(!model.take_reset_pulse(2).unwrap());
    }

    #[test]
    fn concurrent_writers_never_expose_torn_state() {
        let model = DeviceModel::new();
        let mut handles = Vec::new();

        for unit in 1..=4u8 {
            let model = model.clone();
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    model.set_running(unit, i % 2 == 0).unwrap();
                }
            }));
        }
        for _ in 0..2 {
            let model = model.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    assert_consistent(&model.snapshot());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Each writer ends on an odd iteration, i.e. `false`.
        assert_eq!(model.active_count(), 0);
        assert_consistent(&model.snapshot());
    }
}
